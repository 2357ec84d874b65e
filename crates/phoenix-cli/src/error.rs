//! Error types for the CLI

use std::path::PathBuf;

use phoenix_recovery::RecoveryError;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration {}: {source}", .path.display())]
    Config {
        path: PathBuf,
        source: phoenix_common::Error,
    },

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Cluster(#[from] phoenix_common::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(path: impl Into<PathBuf>, source: phoenix_common::Error) -> Self {
        Error::Config {
            path: path.into(),
            source,
        }
    }

    /// Unsettled-operator table carried by a settle failure
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Error::Recovery(e) => e.diagnostics(),
            Error::Cluster(phoenix_common::Error::Unsettled { table, .. }) => Some(table),
            _ => None,
        }
    }
}
