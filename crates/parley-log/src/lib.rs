// ABOUTME: Shared tracing setup for parley binaries
// ABOUTME: init() logs to stderr, init_file() logs under the parley config directory

use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Tracing targets that log at the requested level; `parley` is the binary
const PARLEY_TARGETS: [&str; 6] = [
    "parley_core",
    "parley_store",
    "parley_engine",
    "parley_cli",
    "parley_log",
    "parley",
];

/// Directory holding log files for `app_name`: `<config_dir>/parley/<app_name>`.
pub fn log_dir(app_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("parley").join(app_name))
}

/// Stderr logging. Default: INFO for parley crates, WARN for dependencies.
/// `RUST_LOG` overrides both.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter(tracing::Level::INFO))
        .with_writer(std::io::stderr)
        .init();
}

/// File logging for hosts that own the terminal (desktop shells, TUIs).
/// Logs to `<config_dir>/parley/{app_name}/{app_name}.log` at WARN by default.
/// If setup fails, prints a warning to stderr and continues without logging.
pub fn init_file(app_name: &str) {
    if let Err(e) = init_file_inner(app_name) {
        eprintln!("Warning: failed to set up file logging: {e}");
    }
}

fn init_file_inner(app_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let dir = log_dir(app_name).ok_or("could not determine config directory")?;
    std::fs::create_dir_all(&dir)?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{app_name}.log")))?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(default_filter(tracing::Level::WARN))
        .with_ansi(false)
        .init();

    Ok(())
}

fn default_filter(level: tracing::Level) -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        return EnvFilter::from_default_env();
    }
    parley_filter(level)
}

fn parley_filter(level: tracing::Level) -> EnvFilter {
    let mut filter = EnvFilter::new(tracing::Level::WARN.to_string());
    for target in PARLEY_TARGETS {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}
