//! Prompt text the loop feeds back to the model.
//!
//! - The self-assessment ("monitoring") prompt appended after each tool result
//! - System-prompt composition for histories that have none

use std::collections::HashMap;

use crate::inference::{ChatMessage, Role};
use crate::mcp_client::{ProviderConfig, ToolDescriptor};

// ─── Monitoring Prompt ───────────────────────────────────────────────────────

const ASSESS: &str = "Take a moment to assess: Does the most recent tool result indicate you've successfully completed the user's request? If so, it's time to summarize your work and conclude rather than continuing.";

/// Build the user message spliced in after the `tool_count`-th tool result.
///
/// Guidance tightens as the count grows: 1, 2-3, 4-6, 7-9, 10+.
pub fn monitoring_prompt(tool_count: u32, tool_result: &str, original_message: Option<&str>) -> String {
    let mut prompt = format!("Tool result: {tool_result}\n\n");

    if let Some(original) = original_message.filter(|m| !m.is_empty()) {
        prompt.push_str(&format!("REMINDER: Your original task was: \"{original}\"\n\n"));
    }

    let guidance = match tool_count {
        1 => "You've executed 1 tool call. Continue if you're making progress toward your original goal.".to_string(),
        0..=3 => format!(
            "You've now executed {tool_count} tool calls. {ASSESS} If not, are you getting closer to completing the user's request? If you're uncertain about the next step, consider asking the user for clarification."
        ),
        4..=6 => format!(
            "You've executed {tool_count} tool calls so far. {ASSESS} If not, are you making clear progress toward the original goal, or should you pause and check with the user about your approach?"
        ),
        7..=9 => format!(
            "You've made {tool_count} tool calls now. {ASSESS} If not, you should be close to completing the user's original request. If you're not sure this next step is essential, it's better to ask the user for guidance."
        ),
        _ => format!(
            "You've executed {tool_count} tool calls. {ASSESS} This is quite a lot of tool calls - make sure you're still on track to solve the user's original problem. Consider summarizing what you've accomplished and asking if you should continue."
        ),
    };
    prompt.push_str(&guidance);
    prompt
}

/// The last user message in a history: the task the reminder refers to.
pub fn original_message(history: &[ChatMessage]) -> Option<&str> {
    history
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}

// ─── System Prompt ───────────────────────────────────────────────────────────

/// Produces the system prompt for a conversation.
pub trait PromptComposer: Send + Sync {
    fn compose(
        &self,
        user_prompt: &str,
        providers: &HashMap<String, ProviderConfig>,
        tools: &[ToolDescriptor],
    ) -> String;
}

/// Minimal composer: describes the call format and lists every known tool.
#[derive(Debug, Clone, Default)]
pub struct ToolListComposer;

impl PromptComposer for ToolListComposer {
    fn compose(
        &self,
        _user_prompt: &str,
        providers: &HashMap<String, ProviderConfig>,
        tools: &[ToolDescriptor],
    ) -> String {
        let mut prompt = String::from(
            "You are a helpful assistant with access to tools. To call a tool, reply with a JSON object on its own, starting with a line containing only `{`:\n\
             {\"tool\": \"provider.tool_name\", \"arguments\": {...}}\n\
             After the tool result arrives, continue the task or summarize your answer.\n",
        );

        if tools.is_empty() {
            prompt.push_str("\nNo tools are currently available.\n");
            return prompt;
        }

        prompt.push_str("\nAvailable tools:\n");
        for tool in tools {
            let params: Vec<&str> = tool.parameter_schema.keys().map(|k| k.as_str()).collect();
            prompt.push_str(&format!(
                "- {}({}): {}\n",
                tool.qualified_name(),
                params.join(", "),
                tool.description
            ));
        }

        let mut described: Vec<(&String, &String)> = providers
            .iter()
            .filter_map(|(name, cfg)| cfg.description.as_ref().map(|d| (name, d)))
            .collect();
        if !described.is_empty() {
            described.sort();
            prompt.push_str("\nProviders:\n");
            for (name, description) in described {
                prompt.push_str(&format!("- {name}: {description}\n"));
            }
        }

        prompt
    }
}

/// Insert a composed system prompt when the history has none.
///
/// Returns whether a system message was added.
pub fn prepare_history(
    history: &mut Vec<ChatMessage>,
    composer: &dyn PromptComposer,
    providers: &HashMap<String, ProviderConfig>,
    tools: &[ToolDescriptor],
) -> bool {
    if history.iter().any(|m| m.role == Role::System) {
        return false;
    }
    let user_prompt = original_message(history).unwrap_or_default().to_string();
    let system = composer.compose(&user_prompt, providers, tools);
    history.insert(0, ChatMessage::system(system));
    true
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_prompt_exact() {
        assert_eq!(
            monitoring_prompt(1, "a.txt\nb.txt", Some("list /tmp")),
            "Tool result: a.txt\nb.txt\n\nREMINDER: Your original task was: \"list /tmp\"\n\nYou've executed 1 tool call. Continue if you're making progress toward your original goal."
        );
    }

    #[test]
    fn test_no_reminder_without_original() {
        let prompt = monitoring_prompt(2, "ok", None);
        assert!(!prompt.contains("REMINDER"));
        assert!(prompt.starts_with("Tool result: ok\n\nYou've now executed 2 tool calls."));
        assert!(!monitoring_prompt(2, "ok", Some("")).contains("REMINDER"));
    }

    #[test]
    fn test_tiers() {
        assert!(monitoring_prompt(3, "r", None).contains("You've now executed 3 tool calls."));
        assert!(monitoring_prompt(3, "r", None).contains("consider asking the user for clarification"));
        assert!(monitoring_prompt(4, "r", None).contains("You've executed 4 tool calls so far."));
        assert!(monitoring_prompt(6, "r", None).contains("pause and check with the user"));
        assert!(monitoring_prompt(7, "r", None).contains("You've made 7 tool calls now."));
        assert!(monitoring_prompt(9, "r", None).contains("better to ask the user for guidance"));
        let ten = monitoring_prompt(10, "r", None);
        assert!(ten.contains("You've executed 10 tool calls. Take a moment"));
        assert!(ten.contains("This is quite a lot of tool calls - make sure"));
    }

    #[test]
    fn test_original_message_is_last_user_turn() {
        let history = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ];
        assert_eq!(original_message(&history), Some("second"));
        assert_eq!(original_message(&[ChatMessage::system("s")]), None);
    }

    #[test]
    fn test_prepare_history_inserts_system_once() {
        let tools = vec![ToolDescriptor {
            provider: "fs".into(),
            name: "list_directory".into(),
            description: "List a directory".into(),
            parameter_schema: serde_json::from_value(serde_json::json!({"path": {"type": "string"}}))
                .unwrap(),
        }];
        let providers = HashMap::new();
        let mut history = vec![ChatMessage::user("list /tmp")];

        assert!(prepare_history(&mut history, &ToolListComposer, &providers, &tools));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::System);
        assert!(history[0].content.contains("- fs.list_directory(path): List a directory"));

        assert!(!prepare_history(&mut history, &ToolListComposer, &providers, &tools));
        assert_eq!(history.len(), 2);
    }
}
