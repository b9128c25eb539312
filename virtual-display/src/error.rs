use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::record::ConfigId;

/// Errors surfaced by lifecycle operations.
///
/// Every failure leaves the affected config in a consistent state: the
/// running flag is cleared and the generation tag is kept until the OS
/// confirms teardown or a later operation supersedes it.
#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("serial number {0} is already used by another display")]
    DuplicateSerialNumber(u32),
    #[error("invalid display configuration: {0}")]
    InvalidConfiguration(String),
    #[error("the system refused to create the virtual display")]
    CreationFailed,
    #[error("no display configuration with id {0}")]
    ConfigNotFound(ConfigId),
    #[error("cannot rebuild a virtual display while it is the main display")]
    RebuildMainDisplayWhileRunning,
    #[error("the previous virtual display did not go away in time")]
    TeardownTimedOut,
    #[error("cannot disable the current main display without another display to fall back to")]
    CannotDisableCurrentMainWithoutFallback,
    #[error("display topology could not be inspected, refusing to disable")]
    DisableSafetyCheckUnavailable,
    #[error("display topology did not settle after enabling")]
    TopologyUnstableAfterEnable,
    #[error("display topology repair failed")]
    TopologyRepairFailed,
    #[error("the display coordinator has been shut down")]
    ShutDown,
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

/// Errors raised by the configuration persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed display configuration document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("display configuration document has no schema version")]
    Unversioned,
    #[error("unsupported display configuration schema version {0}")]
    UnsupportedSchema(u32),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_duplicate_serial_mentions_serial() {
        let err = DisplayError::DuplicateSerialNumber(4242);
        assert!(err.to_string().contains("4242"));
    }

    #[test]
    fn test_store_error_converts_into_display_error() {
        let err: DisplayError = StoreError::UnsupportedSchema(9).into();
        assert!(matches!(
            err,
            DisplayError::Persistence(StoreError::UnsupportedSchema(9))
        ));
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn test_io_error_keeps_path() {
        let err = StoreError::io(
            "/tmp/displays.json",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/tmp/displays.json"));
    }
}
