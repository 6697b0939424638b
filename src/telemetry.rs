//! Subscriber setup for the demo binary.

use std::fs::OpenOptions;
use std::io::{self, IsTerminal};

use thiserror::Error;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Errors that can occur during subscriber initialization.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Failed to open log file '{0}': {1}")]
    FileOpen(String, #[source] io::Error),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn writer(output: &str) -> Result<(BoxMakeWriter, bool), TelemetryError> {
    match output {
        "stdout" => Ok((BoxMakeWriter::new(io::stdout), io::stdout().is_terminal())),
        "stderr" => Ok((BoxMakeWriter::new(io::stderr), io::stderr().is_terminal())),
        path => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| TelemetryError::FileOpen(path.to_string(), e))?;
            Ok((BoxMakeWriter::new(file), false))
        }
    }
}

fn layer(config: &LoggingConfig) -> Result<BoxedLayer, TelemetryError> {
    let (make_writer, terminal) = writer(&config.output)?;
    let base = fmt::layer()
        .with_target(config.target)
        .with_span_events(FmtSpan::NONE)
        .with_writer(make_writer);
    let layer: BoxedLayer = match (config.format, config.timestamps) {
        (LogFormat::Text, true) => base.with_ansi(config.color && terminal).boxed(),
        (LogFormat::Text, false) => base
            .with_ansi(config.color && terminal)
            .without_time()
            .boxed(),
        (LogFormat::Json, true) => base.json().boxed(),
        (LogFormat::Json, false) => base.json().without_time().boxed(),
    };
    Ok(layer)
}

/// Install the global subscriber described by `config`.
pub fn init(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| TelemetryError::InvalidFilter(e.to_string()))?;
    tracing_subscriber::registry()
        .with(layer(config)?)
        .with(filter)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))
}
