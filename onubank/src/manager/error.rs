//! Error types for the image manager.

use std::io;
use std::path::PathBuf;

use crate::bank::BankIdError;
use crate::download::DownloadError;
use crate::remote::RemoteError;
use crate::store::StoreError;

/// Result type for image manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors that can occur during image management operations.
#[derive(Debug)]
pub enum ManagerError {
    /// The device supports rebooting only; no upgrade service is available.
    Unsupported,

    /// Invalid configuration.
    InvalidConfig(String),

    /// Failed to copy the image into the staging location.
    CopyFailed {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    /// A variable store operation failed.
    Store(StoreError),

    /// A remote call failed.
    Remote(RemoteError),

    /// A download operation failed.
    Download(DownloadError),

    /// A bank identifier was rejected.
    Bank(BankIdError),
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsupported => {
                write!(f, "device supports system reboot only")
            }
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Self::CopyFailed { from, to, source } => {
                write!(
                    f,
                    "failed to copy {} to {}: {}",
                    from.display(),
                    to.display(),
                    source
                )
            }
            Self::Store(e) => write!(f, "variable store error: {}", e),
            Self::Remote(e) => write!(f, "remote call failed: {}", e),
            Self::Download(e) => write!(f, "download error: {}", e),
            Self::Bank(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ManagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CopyFailed { source, .. } => Some(source),
            Self::Store(e) => Some(e),
            Self::Remote(e) => Some(e),
            Self::Download(e) => Some(e),
            Self::Bank(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for ManagerError {
    fn from(e: StoreError) -> Self {
        // A store refusing service means the whole device is reboot-only.
        match e {
            StoreError::Unsupported => ManagerError::Unsupported,
            other => ManagerError::Store(other),
        }
    }
}

impl From<RemoteError> for ManagerError {
    fn from(e: RemoteError) -> Self {
        ManagerError::Remote(e)
    }
}

impl From<DownloadError> for ManagerError {
    fn from(e: DownloadError) -> Self {
        ManagerError::Download(e)
    }
}

impl From<BankIdError> for ManagerError {
    fn from(e: BankIdError) -> Self {
        ManagerError::Bank(e)
    }
}
