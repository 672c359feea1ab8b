//! `toolstream <prompt>`: stream one answer to stdout.
//!
//! Ctrl-C cancels the stream; a second Ctrl-C is ignored until the stream
//! has wound down.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use toolstream::config::{find_config_path, load_engine_config, EngineConfig};
use toolstream::inference::ChatMessage;
use toolstream::{Engine, StreamEvent, StreamStatus};

/// CLI arguments for toolstream
#[derive(Parser, Debug)]
#[command(name = "toolstream", about = "Stream a local model's answer, running the tools it calls")]
struct Cli {
    /// Prompt to send
    prompt: Vec<String>,
    /// Config file (defaults to toolstream.yaml found from the working directory)
    #[arg(long, value_name = "PATH", env = "TOOLSTREAM_CONFIG")]
    config: Option<PathBuf>,
    /// Model to use instead of the configured one
    #[arg(long, value_name = "MODEL", env = "TOOLSTREAM_MODEL")]
    model: Option<String>,
    /// Override the tool-call bound
    #[arg(long, value_name = "INT")]
    max_cycles: Option<u32>,
    /// Print the available tools and exit
    #[arg(long)]
    list_tools: bool,
    /// Print the models installed on the model server and exit
    #[arg(long)]
    list_models: bool,
}

fn resolve_config(cli: &Cli) -> anyhow::Result<(EngineConfig, PathBuf)> {
    let cwd = std::env::current_dir().context("reading working directory")?;
    let path = cli.config.clone().or_else(|| find_config_path(&cwd));

    let (mut config, base_dir) = match path {
        Some(path) => {
            let config = load_engine_config(&path)?;
            let base_dir = path.parent().map(PathBuf::from).unwrap_or_else(|| cwd.clone());
            tracing::info!(path = %path.display(), "loaded engine config");
            (config, base_dir)
        }
        None => {
            tracing::info!("no config file found, using defaults");
            (EngineConfig::default(), cwd)
        }
    };

    if let Some(model) = &cli.model {
        config.model.name = model.clone();
    }
    if let Some(max) = cli.max_cycles {
        anyhow::ensure!(max > 0, "--max-cycles must be at least 1");
        config.orchestration.max_cycles = max;
    }
    Ok((config, base_dir))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_dir = toolstream::data_dir().join("logs");
    toolstream::init_tracing(&log_dir).context("initializing logging")?;

    let (config, base_dir) = resolve_config(&cli)?;
    let engine = Engine::from_config(config, &base_dir)?;

    if cli.list_models {
        for model in engine.list_models().await? {
            println!("{}", model.name);
        }
        return Ok(());
    }

    for (name, error) in engine.start_providers().await {
        eprintln!("warning: provider '{name}' failed to start: {error}");
    }

    if cli.list_tools {
        for tool in engine.available_tools().await {
            println!("{}  {}", tool.qualified_name(), tool.description);
        }
        engine.shutdown().await;
        return Ok(());
    }

    let prompt = cli.prompt.join(" ");
    if prompt.trim().is_empty() {
        engine.shutdown().await;
        anyhow::bail!("no prompt given");
    }

    let sweeper = engine.start_sweeper();
    let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();
    let handle = engine.stream_chat(None, vec![ChatMessage::user(prompt)], Arc::new(tx));

    let mut stdout = std::io::stdout();
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    write!(stdout, "{}", event.content)?;
                    stdout.flush()?;
                    if event.done {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = engine.cancel_stream(&handle.channel_id);
                if !interrupted {
                    tracing::debug!(channel_id = %handle.channel_id, "ctrl-c after stream finished");
                }
            }
        }
    }
    writeln!(stdout)?;

    let result = handle.task.await.context("stream task panicked")?;
    engine.shutdown().await;
    let _ = sweeper.await;

    let outcome = result?;
    if outcome.status == StreamStatus::Cancelled {
        eprintln!("(cancelled)");
    }
    tracing::info!(
        status = outcome.status.as_str(),
        tool_calls = outcome.tool_calls,
        "cli stream finished"
    );
    Ok(())
}
