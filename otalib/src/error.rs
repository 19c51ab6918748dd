use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of failure reasons reported to callers. Callers are expected to
/// branch on these values and never on the text of the underlying errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub enum ErrorKind {
    NullOrInvalidMetadata,
    InvalidUrlScheme,
    InsufficientStorage,
    /// Transport-level failure. Retried internally before being surfaced.
    ConnectionError,
    /// Server returned an unsuccessful response. Never retried automatically
    /// since it usually indicates a bad link.
    ServerError,
    /// The bytes were downloaded, but could not be moved into place.
    CouldNotPersistFile,
    UnknownInternal,
    MissingProvidedChecksum,
    UnableToComputeChecksum,
    ChecksumMismatch,
}

impl ErrorKind {
    /// Whether the failure originates from this program or its inputs rather
    /// than from the device or the server.
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            Self::NullOrInvalidMetadata
                | Self::InvalidUrlScheme
                | Self::UnknownInternal
                | Self::MissingProvidedChecksum
                | Self::UnableToComputeChecksum
        )
    }

    pub fn is_storage(self) -> bool {
        matches!(self, Self::InsufficientStorage | Self::CouldNotPersistFile)
    }

    pub fn is_server(self) -> bool {
        matches!(self, Self::ServerError)
    }

    /// Whether re-enqueueing the same artifact has a chance of succeeding.
    /// Metadata errors require new metadata and placement errors require the
    /// user to delete and start over.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            Self::NullOrInvalidMetadata
                | Self::InvalidUrlScheme
                | Self::MissingProvidedChecksum
                | Self::CouldNotPersistFile
        )
    }

    pub fn is_verification(self) -> bool {
        matches!(
            self,
            Self::MissingProvidedChecksum
                | Self::UnableToComputeChecksum
                | Self::ChecksumMismatch
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NullOrInvalidMetadata => "Update metadata is missing or invalid",
            Self::InvalidUrlScheme => "Download URL does not use HTTP or HTTPS",
            Self::InsufficientStorage => "Not enough free space to store the update",
            Self::ConnectionError => "Connection to the download server failed",
            Self::ServerError => "Download server returned an unsuccessful response",
            Self::CouldNotPersistFile => "Downloaded file could not be moved into place",
            Self::UnknownInternal => "Unknown internal error",
            Self::MissingProvidedChecksum => "No checksum was provided for the update",
            Self::UnableToComputeChecksum => "Checksum of the downloaded file could not be computed",
            Self::ChecksumMismatch => "Downloaded file is corrupted (checksum mismatch)",
        })
    }
}
