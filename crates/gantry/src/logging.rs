use std::{fs, io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::config;

/// Keeps the non-blocking log writer flushing; hold it for the process
/// lifetime.
#[derive(Debug)]
pub struct LogGuard {
    _worker: WorkerGuard,
}

pub fn init(cfg: &config::LoggingConfig) -> anyhow::Result<LogGuard> {
    let (writer, worker) = writer_for(&cfg.output)?;
    let json = cfg.format.trim().eq_ignore_ascii_case("json");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(build_filter(&cfg.level))
        .with_writer(writer)
        .with_target(true)
        .with_file(cfg.add_source)
        .with_line_number(cfg.add_source)
        .with_ansi(!json);

    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(|err| anyhow::anyhow!("logging: subscriber init: {err}"))?;

    Ok(LogGuard { _worker: worker })
}

/// The configured level is the default; a RUST_LOG value layers its own
/// directives on top.
fn build_filter(level: &str) -> EnvFilter {
    let fallback = match level.trim().to_ascii_lowercase().as_str() {
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };
    EnvFilter::builder()
        .with_default_directive(fallback.into())
        .from_env_lossy()
}

fn writer_for(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    let sink: Box<dyn io::Write + Send> = match output.trim() {
        "" | "stderr" => Box::new(io::stderr()),
        "stdout" => Box::new(io::stdout()),
        "discard" => Box::new(io::sink()),
        path => {
            let path = Path::new(path);
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)
                    .with_context(|| format!("logging: log directory {}", dir.display()))?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("logging: log file {}", path.display()))?;
            Box::new(file)
        }
    };
    Ok(tracing_appender::non_blocking(sink))
}
