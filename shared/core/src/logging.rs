use std::{fs::OpenOptions, io::Write, path::Path, path::PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{filter::FromEnvError, fmt, EnvFilter, Layer};

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq)]
pub enum LogOutput {
    Console,
    Json,
    None,
}

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            write_logs_file: None,
        }
    }

    /// Set the log output format
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Set the log level
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log file path (optional)
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.write_logs_file = path.into();
        self
    }

    pub fn init(self) -> anyhow::Result<()> {
        init_logging_core(self.output, self.level, self.write_logs_file)
    }
}

/// Create a new logging builder
pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}

fn init_logging_core(
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let make_filter = || -> Result<EnvFilter, FromEnvError> {
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()
    };

    // replicas run on threads named `replica-<rank>`
    let mut layers: Vec<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>> = Vec::new();

    match output {
        LogOutput::Console => layers.push(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_thread_names(true)
                .with_filter(make_filter()?)
                .boxed(),
        ),
        LogOutput::Json => layers.push(
            fmt::layer()
                .json()
                .with_writer(std::io::stdout)
                .flatten_event(true)
                .with_current_span(true)
                .with_filter(make_filter()?)
                .boxed(),
        ),
        LogOutput::None => {}
    }

    if let Some(log_file_path) = write_logs_file {
        let log_file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_file_path)?;

        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(log_file)
                .with_filter(make_filter()?)
                .boxed(),
        );
    }

    let subscriber = tracing_subscriber::registry().with(layers);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Append one line to a plain-text run log, creating it if needed.
///
/// Callers gate this on the coordinating rank; it performs no rank check itself.
pub fn append_log_line(path: impl AsRef<Path>, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    file.flush()
}
