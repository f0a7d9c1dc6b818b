use crate::reference::InvalidReference;
use crate::registry::RegistryError;
use thiserror::Error;

/// Failure of a sync, read, update or delete operation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    InvalidReference(#[from] InvalidReference),

    #[error("source image '{0}' not present in remote")]
    SourceNotFound(String),

    #[error("destination '{0}' was written but could not be read back")]
    DestinationVanished(String),

    #[error(transparent)]
    Registry(RegistryError),

    /// The destination tag is gone but its manifest may have leaked.
    #[error(
        "deleted '{destination}' but could not decide whether '{identity}' is still referenced, manual cleanup may be required: {reason}"
    )]
    PartialCleanup {
        destination: String,
        identity: String,
        reason: String,
    },

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl From<RegistryError> for SyncError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Cancelled(what) => SyncError::Cancelled(what),
            other => SyncError::Registry(other),
        }
    }
}

impl SyncError {
    /// Whether the error leaves the destination tag deleted and only the
    /// orphan check unfinished
    pub fn is_partial_cleanup(&self) -> bool {
        matches!(self, SyncError::PartialCleanup { .. })
    }
}
