use crate::cli::LogOutput;
use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: console or json to stdout, plus an
/// optional mirror file. Returns the file writer's guard; dropping it
/// flushes the file.
pub fn init(output: LogOutput, write_log: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = match output {
        LogOutput::Console => Some(tracing_subscriber::fmt::layer().boxed()),
        LogOutput::Json => Some(tracing_subscriber::fmt::layer().json().boxed()),
        LogOutput::None => None,
    };

    let (file_layer, guard) = match write_log {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}
