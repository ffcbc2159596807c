//! # podkit Common
//!
//! Pieces shared by the podkit crates: the cross-cutting error type,
//! subscriber setup, and retry/timeout helpers used around network and
//! storage work.

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};
pub use retry::{retry_if, retry_with_backoff, with_timeout, RetryConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that are not specific to one podkit crate.
#[derive(Error, Debug)]
pub enum PodkitError {
    /// Invalid or unreadable configuration.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistent cache storage could not be read or written.
    #[error("Storage error: {action}")]
    Storage {
        action: String,
        #[source]
        source: BoxError,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A bug: something that should not fail did.
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl PodkitError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Internal error with a captured backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PodkitError::Timeout(_) | PodkitError::Io(_) | PodkitError::Storage { .. }
        )
    }

    /// Short label for the `category` log field.
    pub fn category(&self) -> &'static str {
        match self {
            PodkitError::Config { .. } => "config",
            PodkitError::Io(_) => "io",
            PodkitError::Storage { .. } => "storage",
            PodkitError::Timeout(_) => "timeout",
            PodkitError::Internal { .. } => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, PodkitError>;

/// Attach what was being attempted to a foreign error.
pub trait ResultExt<T> {
    /// The error came from disk or another persistent store.
    fn storage_context(self, action: impl Into<String>) -> Result<T>;

    /// The error indicates a bug; a backtrace is captured.
    fn internal_context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn storage_context(self, action: impl Into<String>) -> Result<T> {
        self.map_err(|e| PodkitError::Storage {
            action: action.into(),
            source: Box::new(e),
        })
    }

    fn internal_context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| PodkitError::internal(format!("{}: {e}", message.into())))
    }
}
