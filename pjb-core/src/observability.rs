use crate::config::SystemLogConfig;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking log writer alive; drop it last to flush.
pub struct LogGuard {
    _writer: WorkerGuard,
}

pub fn init_logging(system: &SystemLogConfig) -> Result<LogGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(system.level.clone()));
    let (writer, guard) = build_non_blocking_writer(system)?;

    let layer = match system.format.to_ascii_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(writer)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_filter(filter)
            .boxed(),
        "compact" => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(writer)
            .compact()
            .with_filter(filter)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(writer)
            .pretty()
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(layer).try_init()?;

    Ok(LogGuard { _writer: guard })
}

fn build_non_blocking_writer(system: &SystemLogConfig) -> Result<(NonBlocking, WorkerGuard)> {
    use tracing_appender::rolling;

    let builder = NonBlockingBuilder::default().lossy(false);
    match system.output.to_ascii_lowercase().as_str() {
        "stdout" => Ok(builder.finish(std::io::stdout())),
        "file" => {
            let path = system
                .file
                .as_deref()
                .ok_or_else(|| anyhow!("system_log.file is required when output is file"))?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow!("system_log.file must include a file name"))?;
            Ok(builder.finish(rolling::never(&dir, file_name)))
        }
        _ => Ok(builder.finish(std::io::stderr())),
    }
}
