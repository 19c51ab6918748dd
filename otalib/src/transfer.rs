use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::Bytes;
use futures_core::Stream;
use log::{debug, trace, warn};
use reqwest::{
    header::RANGE,
    StatusCode,
};
use thiserror::Error;
use tokio::{
    fs::OpenOptions,
    io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt},
    task,
    time::timeout,
};
use tokio_stream::StreamExt;

use crate::{
    artifact::{ArtifactMetadata, ArtifactPaths},
    control::{is_stop_requested, JobListener},
    error::ErrorKind,
    file::{file_len, persist_file},
    retry::FailureClass,
};

/// Maximum number of bytes written per loop iteration.
pub const BUFFER_SIZE: usize = 8 * 1024;

/// Allowed disagreement between the server's reported size and the metadata
/// before a warning is logged.
pub const SIZE_TOLERANCE: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferFailure {
    #[error("Unsuccessful response for {filename:?} from {url}: HTTP {status}")]
    UnsuccessfulResponse {
        url: String,
        filename: String,
        status: StatusCode,
    },
    #[error("Connection error: {0}")]
    Connection(#[from] reqwest::Error),
    #[error("No data received within {0:?}")]
    ReadTimeout(Duration),
    #[error("Server closed the connection after {received} of {expected} bytes")]
    UnexpectedEof {
        received: u64,
        expected: u64,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Could not move {src:?} to {dest:?}: {source}")]
    CouldNotPersistFile {
        src: PathBuf,
        dest: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransferFailure {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::UnsuccessfulResponse { .. } => FailureClass::Server,
            Self::Connection(_) | Self::ReadTimeout(_) | Self::UnexpectedEof { .. } => {
                FailureClass::Connection
            }
            Self::Io(_) | Self::CouldNotPersistFile { .. } => FailureClass::Io,
        }
    }

    /// Kind reported to callers once the failure is surfaced.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsuccessfulResponse { .. } => ErrorKind::ServerError,
            Self::Connection(_) | Self::ReadTimeout(_) | Self::UnexpectedEof { .. } => {
                ErrorKind::ConnectionError
            }
            Self::Io(_) => ErrorKind::UnknownInternal,
            Self::CouldNotPersistFile { .. } => ErrorKind::CouldNotPersistFile,
        }
    }
}

/// Result of one transfer attempt.
#[derive(Debug)]
pub enum TransferOutcome {
    /// All bytes were received and the file was moved to its final location.
    Success {
        bytes_downloaded: u64,
    },
    /// A stop was requested and honored after the last complete buffer write.
    Interrupted {
        bytes_downloaded: u64,
    },
    /// The attempt failed, but the partial file is intact up to
    /// `bytes_downloaded` and may be resumed.
    RetryableFailure {
        failure: TransferFailure,
        bytes_downloaded: u64,
    },
    /// Retrying the transfer would not help.
    FatalFailure(TransferFailure),
}

/// HTTP client configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HttpOptions {
    pub connect_timeout: Duration,
    /// Maximum time to wait for the next piece of the response body.
    pub read_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
        }
    }
}

/// Outcome of streaming a response body to a file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopyStatus {
    Finished(u64),
    Stopped(u64),
}

/// Write a stream of byte chunks to `writer` in pieces of at most
/// [`BUFFER_SIZE`] bytes. `position` is the file offset of the first byte;
/// after every write, `progress` is called with the new offset. The stop
/// signal is checked after each write, so every buffer that is started also
/// gets completed. On error, the offset reached so far is returned along with
/// the failure.
pub async fn copy_stream<S, E, W, F>(
    mut stream: S,
    writer: &mut W,
    mut position: u64,
    read_timeout: Duration,
    control: &JobListener,
    progress: &mut F,
) -> Result<CopyStatus, (TransferFailure, u64)>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<TransferFailure>,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    loop {
        if is_stop_requested(control) {
            debug!("Stop requested at offset {}", position);
            writer.flush().await.map_err(|e| (e.into(), position))?;
            return Ok(CopyStatus::Stopped(position));
        }

        let data = match timeout(read_timeout, stream.next()).await {
            Err(_) => return Err((TransferFailure::ReadTimeout(read_timeout), position)),
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err((e.into(), position)),
            Ok(Some(Ok(data))) => data,
        };
        trace!("Received {} bytes", data.len());

        for chunk in data.chunks(BUFFER_SIZE) {
            writer.write_all(chunk).await.map_err(|e| (e.into(), position))?;
            position += chunk.len() as u64;
            progress(position);

            if is_stop_requested(control) {
                debug!("Stop requested at offset {}", position);
                writer.flush().await.map_err(|e| (e.into(), position))?;
                return Ok(CopyStatus::Stopped(position));
            }
        }
    }

    writer.flush().await.map_err(|e| (e.into(), position))?;

    Ok(CopyStatus::Finished(position))
}

/// Figure out where a resumed transfer should start. If the partial file is
/// shorter than the checkpoint says, some writes never made it to disk and the
/// transfer restarts from zero. A longer file is tolerated; the extra bytes
/// get overwritten.
pub fn validate_resume_offset(temp_path: &Path, offset: u64) -> io::Result<u64> {
    if offset == 0 {
        return Ok(0);
    }

    match file_len(temp_path)? {
        None => {
            warn!("Partial file {:?} is missing; restarting from zero", temp_path);
            Ok(0)
        }
        Some(len) if len < offset => {
            warn!("Partial file {:?} has {} bytes, but checkpoint has {}; restarting from zero",
                temp_path, len, offset);
            Ok(0)
        }
        Some(len) => {
            if len > offset {
                warn!("Partial file {:?} has {} bytes, which is more than the checkpoint's {}",
                    temp_path, len, offset);
            }
            Ok(offset)
        }
    }
}

/// Whether the sizes reported by the server and the metadata differ enough
/// to be worth a warning.
pub fn size_mismatch(offset: u64, content_length: u64, expected: u64) -> bool {
    offset.saturating_add(content_length).abs_diff(expected) > SIZE_TOLERANCE
}

async fn truncate_file(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    file.sync_all().await
}

/// Move a completely downloaded temporary file to its final location.
async fn publish_download(paths: &ArtifactPaths, bytes_downloaded: u64) -> TransferOutcome {
    let src = paths.temp_path.clone();
    let dest = paths.final_path.clone();

    debug!("Moving {:?} to {:?}", src, dest);

    let persisted = task::spawn_blocking({
        let (src, dest) = (src.clone(), dest.clone());
        move || persist_file(&src, &dest)
    }).await.unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)));

    match persisted {
        Ok(_) => TransferOutcome::Success { bytes_downloaded },
        Err(source) => TransferOutcome::FatalFailure(TransferFailure::CouldNotPersistFile {
            src,
            dest,
            source,
        }),
    }
}

/// Performs the HTTP transfer of an artifact into its temporary file and
/// publishes the file once complete.
#[derive(Clone, Debug)]
pub struct TransferEngine {
    client: reqwest::Client,
    read_timeout: Duration,
}

impl TransferEngine {
    pub fn new(options: HttpOptions) -> Result<Self, reqwest::Error> {
        debug!("HTTP options: {:?}", options);

        let client = reqwest::ClientBuilder::new()
            .connect_timeout(options.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            read_timeout: options.read_timeout,
        })
    }

    /// Download `artifact`, resuming at `offset` if it is non-zero.
    pub async fn download<F: FnMut(u64)>(
        &self,
        artifact: &ArtifactMetadata,
        paths: &ArtifactPaths,
        offset: u64,
        control: &JobListener,
        mut progress: F,
    ) -> TransferOutcome {
        let mut offset = match validate_resume_offset(&paths.temp_path, offset) {
            Ok(o) => o,
            Err(e) => return TransferOutcome::RetryableFailure {
                failure: e.into(),
                bytes_downloaded: 0,
            },
        };

        if is_stop_requested(control) {
            return TransferOutcome::Interrupted { bytes_downloaded: offset };
        }

        // The previous attempt stopped right after its last write
        if offset >= artifact.expected_size {
            debug!("Partial file already holds all {} bytes", artifact.expected_size);

            return match truncate_file(&paths.temp_path, artifact.expected_size).await {
                Ok(()) => publish_download(paths, artifact.expected_size).await,
                Err(e) => TransferOutcome::RetryableFailure {
                    failure: e.into(),
                    bytes_downloaded: offset,
                },
            };
        }

        let mut request = self.client.get(&artifact.download_url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        debug!("Requesting {} from offset {}", artifact.download_url, offset);

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return TransferOutcome::RetryableFailure {
                failure: e.into(),
                bytes_downloaded: offset,
            },
        };

        let status = response.status();
        let content_length = response.content_length();

        debug!("Response status: {}, length: {:?}", status, content_length);

        let no_body = status == StatusCode::NO_CONTENT
            || (content_length == Some(0) && offset < artifact.expected_size);
        if !status.is_success() || no_body {
            return TransferOutcome::RetryableFailure {
                failure: TransferFailure::UnsuccessfulResponse {
                    url: artifact.download_url.clone(),
                    filename: artifact.filename.clone(),
                    status,
                },
                bytes_downloaded: offset,
            };
        }

        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            warn!("Server ignored range request (HTTP {}); restarting from zero", status);
            offset = 0;
        }

        if let Some(len) = content_length {
            if size_mismatch(offset, len, artifact.expected_size) {
                warn!("Server reports {} bytes from offset {}, but {} bytes were expected in total",
                    len, offset, artifact.expected_size);
            }
        }

        let result = self.write_body(response, paths, offset, content_length, control, &mut progress).await;
        let bytes_downloaded = match result {
            Ok(CopyStatus::Finished(n)) => n,
            Ok(CopyStatus::Stopped(n)) => return TransferOutcome::Interrupted { bytes_downloaded: n },
            Err((failure, n)) => return TransferOutcome::RetryableFailure {
                failure,
                bytes_downloaded: n,
            },
        };

        publish_download(paths, bytes_downloaded).await
    }

    async fn write_body<F: FnMut(u64)>(
        &self,
        response: reqwest::Response,
        paths: &ArtifactPaths,
        offset: u64,
        content_length: Option<u64>,
        control: &JobListener,
        progress: &mut F,
    ) -> Result<CopyStatus, (TransferFailure, u64)> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&paths.temp_path)
            .await
            .map_err(|e| (e.into(), offset))?;

        if offset == 0 {
            file.set_len(0).await.map_err(|e| (e.into(), 0))?;
        }
        file.seek(SeekFrom::Start(offset)).await.map_err(|e| (e.into(), offset))?;

        let stream = response.bytes_stream();
        tokio::pin!(stream);

        let status = copy_stream(stream, &mut file, offset, self.read_timeout, control, progress).await?;

        if let CopyStatus::Finished(position) = status {
            if let Some(len) = content_length {
                let expected = offset + len;
                if position < expected {
                    return Err((TransferFailure::UnexpectedEof {
                        received: position,
                        expected,
                    }, position));
                }
            }

            // Drop any stale bytes past the end of a resumed download
            file.set_len(position).await.map_err(|e| (e.into(), position))?;
        }

        file.sync_all().await.map_err(|e| {
            let position = match status {
                CopyStatus::Finished(n) | CopyStatus::Stopped(n) => n,
            };
            (e.into(), position)
        })?;

        Ok(status)
    }
}
