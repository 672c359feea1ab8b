pub mod agent_core;
pub mod config;
pub mod engine;
pub mod inference;
pub mod mcp_client;

use std::io::Write;
use std::path::{Path, PathBuf};

pub use agent_core::{AgentError, StreamEvent, StreamOutcome, StreamStatus};
pub use config::EngineConfig;
pub use engine::{Engine, StreamHandle};

/// Return the platform-standard data directory for toolstream.
///
/// - macOS: `~/Library/Application Support/toolstream/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolstream\`
/// - Linux: `$XDG_DATA_HOME/toolstream/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolstream/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolstream");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolstream")
}

/// Active log file name inside the log directory.
const LOG_FILE_NAME: &str = "engine.log";

/// Rotated generations kept next to the active log.
const LOG_GENERATIONS: u32 = 3;

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "toolstream=info,warn";

/// Install the line-flushed file logger under `log_dir`.
///
/// The previous run's log is shifted to `engine.log.1` first. Returns the
/// active log path. When a subscriber is already installed (tests, embedding
/// hosts) the file is still rotated and created but nothing is logged to it.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, LOG_GENERATIONS);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let installed = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(LineFlushWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %log_path.display(),
            pid = std::process::id(),
            "=== toolstream starting ==="
        );
    }
    Ok(log_path)
}

/// `engine.log` + `3` → `engine.log.3`.
fn generation_path(base: &Path, generation: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Shift `base` → `.1` → `.2` … and drop whatever falls past `keep`.
///
/// Best effort: a missing link in the chain is skipped.
fn rotate_log_file(base: &Path, keep: u32) {
    if keep == 0 {
        std::fs::remove_file(base).ok();
        return;
    }
    std::fs::remove_file(generation_path(base, keep)).ok();
    for generation in (1..keep).rev() {
        std::fs::rename(
            generation_path(base, generation),
            generation_path(base, generation + 1),
        )
        .ok();
    }
    if base.exists() {
        std::fs::rename(base, generation_path(base, 1)).ok();
    }
}

/// Shared log file handle that flushes on every write, so the tail of the
/// log survives a killed process.
#[derive(Clone)]
struct LineFlushWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl LineFlushWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }

    fn file(&self) -> std::sync::MutexGuard<'_, std::fs::File> {
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Write for LineFlushWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.file();
        file.write_all(buf)?;
        file.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LineFlushWriter {
    type Writer = LineFlushWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
