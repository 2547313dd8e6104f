use super::config::LogLevel;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to initialize logging: {details}")]
    InitFailed {
        details: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// A `target=level` filter entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirective {
    target: String,
    level: LogLevel,
}

impl LogDirective {
    pub fn new(target: impl Into<String>, level: LogLevel) -> Self {
        Self {
            target: target.into(),
            level,
        }
    }

    pub fn to_filter_string(&self) -> String {
        format!("{}={}", self.target, self.level.as_str())
    }
}

pub struct LoggingSystem {
    directives: Arc<RwLock<Vec<LogDirective>>>,
}

impl LoggingSystem {
    pub fn new() -> Self {
        Self {
            directives: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Quiets the codec crates, which are chatty at debug level.
    pub fn add_default_directives(&self) {
        let mut directives = self.directives.write();
        for target in ["flate2", "zip"] {
            directives.push(LogDirective::new(target, LogLevel::Warn));
        }
    }

    pub fn build_filter_string(&self, default_level: LogLevel) -> String {
        let directives = self.directives.read();
        let mut parts = Vec::with_capacity(directives.len() + 1);
        parts.push(default_level.as_str().to_string());
        parts.extend(directives.iter().map(LogDirective::to_filter_string));
        parts.join(",")
    }

    /// Installs the global subscriber. `RUST_LOG` wins over the configured
    /// level when set.
    pub fn initialize_tracing(&self, default_level: LogLevel) -> Result<(), LoggingError> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => {
                let filter_string = self.build_filter_string(default_level);
                EnvFilter::try_new(&filter_string).map_err(|e| LoggingError::InitFailed {
                    details: format!("Failed to create EnvFilter with '{filter_string}'"),
                    source: Box::new(e),
                })?
            }
        };

        let subscriber = tracing_subscriber::registry().with(env_filter).with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_writer(std::io::stderr)
                .compact(),
        );

        tracing::subscriber::set_global_default(subscriber).map_err(|e| {
            LoggingError::InitFailed {
                details: "Failed to set global tracing subscriber".to_string(),
                source: Box::new(e),
            }
        })
    }
}

impl Default for LoggingSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes logging once per process; later calls report the first
/// outcome.
pub fn setup_logging_safe(level: LogLevel) -> Result<(), LoggingError> {
    use std::sync::OnceLock;

    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    let outcome = INIT.get_or_init(|| {
        let logging_system = LoggingSystem::new();
        logging_system.add_default_directives();
        logging_system
            .initialize_tracing(level)
            .map_err(|e| e.to_string())
    });

    outcome.clone().map_err(|details| LoggingError::InitFailed {
        details,
        source: Box::new(std::io::Error::other("logging initialization error")),
    })
}
