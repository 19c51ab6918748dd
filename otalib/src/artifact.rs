use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{error::ErrorKind, file::add_extension};

/// Extension of the temporary file that receives bytes until the transfer
/// completes.
pub const DOWNLOAD_EXT: &str = "otadl_download";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Download URL could not be parsed: {0}")]
    BadUrl(#[from] url::ParseError),
    #[error("Download URL scheme is not supported: {0}")]
    UnsupportedScheme(String),
    #[error("Filename is not a plain file name: {0:?}")]
    BadFilename(String),
    #[error("Expected size must not be zero")]
    ZeroSize,
}

impl ArtifactError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadUrl(_) | Self::UnsupportedScheme(_) => ErrorKind::InvalidUrlScheme,
            Self::BadFilename(_) | Self::ZeroSize => ErrorKind::NullOrInvalidMetadata,
        }
    }
}

/// Descriptor of the update file to fetch. This is supplied by whatever
/// resolves update metadata and is never modified afterwards.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct ArtifactMetadata {
    pub download_url: String,
    /// Target filename. Must not contain any directory components
    pub filename: String,
    pub expected_size: u64,
    /// Hex encoded MD5 digest. Compared case-insensitively
    pub expected_checksum: String,
    /// Human-readable version of the update
    #[serde(default)]
    pub version_label: String,
}

impl ArtifactMetadata {
    /// Check that the metadata can be acted on at all.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        let url = Url::parse(&self.download_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ArtifactError::UnsupportedScheme(url.scheme().to_owned()));
        }

        let mut components = Path::new(&self.filename).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(ArtifactError::BadFilename(self.filename.clone())),
        }

        if self.expected_size == 0 {
            return Err(ArtifactError::ZeroSize);
        }

        Ok(())
    }

    /// Compute where the artifact lives inside the download directory.
    pub fn paths(&self, download_dir: &Path) -> ArtifactPaths {
        let final_path = download_dir.join(&self.filename);
        let temp_path = add_extension(&final_path, DOWNLOAD_EXT);

        ArtifactPaths {
            final_path,
            temp_path,
        }
    }
}

/// Locations of the artifact on disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactPaths {
    /// Published location of the completed download
    pub final_path: PathBuf,
    /// Sibling that receives the bytes while downloading
    pub temp_path: PathBuf,
}
