//! Declare error types for slsk-config

use std::sync::Arc;

use thiserror::Error;

use slsk_error::{ErrorKind, HasKind};

/// An error from loading, validating, or applying configuration.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration file")]
    Io(#[source] Arc<std::io::Error>),

    /// The configuration file is not valid YAML for the options tree.
    #[error("cannot parse configuration")]
    Parse(#[source] Arc<serde_yaml::Error>),

    /// The options tree is well-formed but inconsistent.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong with it.
        reason: String,
    },

    /// An options tree could not be serialized for diffing.  This
    /// indicates a bug.
    #[error("cannot serialize options for diffing")]
    Serialize(#[source] Arc<serde_json::Error>),

    /// A module rejected the new configuration.
    #[error("module {module} rejected reconfiguration: {reason}")]
    Rejected {
        /// The module's name.
        module: String,
        /// Why it rejected the change.
        reason: String,
    },

    /// A lock was poisoned.  This indicates a bug.
    #[error("reload plane poisoned")]
    Poisoned,
}

impl HasKind for ConfigError {
    fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Io(_) => ErrorKind::ValidationFailed,
            ConfigError::Parse(_) | ConfigError::Invalid { .. } => ErrorKind::ValidationFailed,
            ConfigError::Serialize(_) => ErrorKind::Internal,
            ConfigError::Rejected { .. } => ErrorKind::ValidationFailed,
            ConfigError::Poisoned => ErrorKind::Internal,
        }
    }
}
