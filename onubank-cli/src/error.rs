//! CLI error types.

use std::error::Error;
use std::fmt;

use onubank::{ConfigError, ManagerError};

/// Errors surfaced to the command line user.
#[derive(Debug)]
pub enum CliError {
    /// The configuration file could not be loaded.
    Config(ConfigError),
    /// A firmware management operation failed.
    Manager(ManagerError),
    /// Report output could not be rendered.
    Output(serde_json::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(e) => write!(f, "{}", e),
            CliError::Manager(e) => write!(f, "{}", e),
            CliError::Output(e) => write!(f, "failed to render output: {}", e),
        }
    }
}

impl Error for CliError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CliError::Config(e) => Some(e),
            CliError::Manager(e) => Some(e),
            CliError::Output(e) => Some(e),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e)
    }
}

impl From<ManagerError> for CliError {
    fn from(e: ManagerError) -> Self {
        CliError::Manager(e)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Output(e)
    }
}
