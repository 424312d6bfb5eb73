//! Process-wide tracing setup

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

static INIT: OnceCell<Option<WorkerGuard>> = OnceCell::new();

#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Fallback filter when `RUST_LOG` is unset
    pub level: Option<String>,
    pub json: bool,
    /// Adds a daily-rolling file layer in this directory
    pub log_dir: Option<PathBuf>,
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_tracing(options: &TelemetryOptions) -> Result<()> {
    INIT.get_or_try_init(|| install(options)).map(|_| ())
}

fn install(options: &TelemetryOptions) -> Result<Option<WorkerGuard>> {
    let level = options.level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log filter")?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(if options.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    });

    let mut guard = None;
    if let Some(dir) = &options.log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, "browserflow.log");
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|err| anyhow!("tracing already initialised: {err}"))?;
    Ok(guard)
}
