//! Structured logging via `tracing`.

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub include_target: bool,
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Verbose config for debugging.
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            ansi_colors: true,
        }
    }

    /// Errors only.
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            include_target: false,
            ansi_colors: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Install the global subscriber. Returns an error message when a
/// subscriber is already set (tests install their own).
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level.to_tracing_level())
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to initialize logging: {e}"))
}

/// Epoch banner helper used by the orchestrator.
pub struct EpochLogger;

impl EpochLogger {
    pub fn epoch_start(training: bool, epoch_idx: usize) {
        tracing::info!(
            "--------------------------------------------------------------------------------"
        );
        tracing::info!(
            "start {} epoch: {}",
            if training { "training" } else { "evaluating" },
            epoch_idx
        );
    }

    pub fn batch_done(epoch_idx: usize, batch_idx: usize, loss: f64, seconds: f64) {
        tracing::info!(
            "epoch: {}, batch: {}, loss: {:.4}, consuming time: {:.4}s",
            epoch_idx,
            batch_idx,
            loss,
            seconds
        );
    }

    pub fn epoch_done(training: bool, epoch_idx: usize, loss: f64, seconds: f64) {
        tracing::info!(
            "{} of epoch {} finished",
            if training { "training" } else { "evaluating" },
            epoch_idx
        );
        tracing::info!(
            "epoch: {}, loss: {:.4}, consuming time: {:.4}s",
            epoch_idx,
            loss,
            seconds
        );
        tracing::info!(
            "--------------------------------------------------------------------------------"
        );
    }
}
