//! Subscriber setup for the sharda binaries.
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Layer, Registry};

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `info` or `sharda_txn=debug,warn`.
    pub level: String,
    /// Hourly rotated `sharda.log` files here; stdout when `None`.
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            dir: None,
            json: false,
        }
    }
}

/// Keeps the file writer flushing and allows changing the filter at runtime.
pub struct LogGuard {
    filter: reload::Handle<EnvFilter, Registry>,
    _writer: Option<WorkerGuard>,
}

impl LogGuard {
    pub fn set_level(&self, directives: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directives).with_context(|| format!("invalid log filter {directives:?}"))?;
        self.filter.reload(filter).context("reloading log filter")?;
        Ok(())
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig) -> Result<LogGuard> {
    let filter = EnvFilter::try_new(&config.level).with_context(|| format!("invalid log filter {:?}", config.level))?;
    let (filter, handle) = reload::Layer::new(filter);

    let (writer, guard) = match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::hourly(dir, "sharda.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };
    let fmt_layer = if config.json {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(config.dir.is_none())
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(LogGuard {
        filter: handle,
        _writer: guard,
    })
}
