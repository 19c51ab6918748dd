use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, warn};
use thiserror::Error;
use tokio::task;

use crate::{
    control::{is_stop_requested, wait, JobListener, WaitResult},
    error::ErrorKind,
    file::delete_if_exists,
};

/// Size of each read while computing the digest.
const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("No checksum was provided")]
    MissingProvidedChecksum,
    #[error("Could not compute checksum after {attempts} attempts: {source}")]
    UnableToComputeChecksum {
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("File checksum ({actual}) does not match expected checksum ({expected})")]
    ChecksumMismatch {
        expected: String,
        actual: String,
    },
    #[error("Verification was stopped")]
    Stopped,
}

impl VerifyError {
    /// Kind reported to callers. A stop is not a failure, so it has none.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::MissingProvidedChecksum => Some(ErrorKind::MissingProvidedChecksum),
            Self::UnableToComputeChecksum { .. } => Some(ErrorKind::UnableToComputeChecksum),
            Self::ChecksumMismatch { .. } => Some(ErrorKind::ChecksumMismatch),
            Self::Stopped => None,
        }
    }
}

/// Compute the lowercase hex MD5 digest of a file by streaming it in fixed
/// size chunks. Returns [`None`] if a stop was requested midway.
pub fn md5_file(path: &Path, control: &JobListener) -> io::Result<Option<String>> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut context = md5::Context::new();

    loop {
        if is_stop_requested(control) {
            return Ok(None);
        }

        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        context.consume(&buf[..n]);
    }

    Ok(Some(format!("{:x}", context.compute())))
}

/// Checks a completed download against its expected MD5 checksum.
///
/// The file may not be visible yet if it was just moved into place, so
/// failures to read it are retried a few times before giving up. There is no
/// partial state: every attempt hashes the file from the beginning.
#[derive(Clone, Copy, Debug)]
pub struct IntegrityVerifier {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl IntegrityVerifier {
    pub async fn verify(
        &self,
        path: &Path,
        expected_checksum: Option<&str>,
        control: &JobListener,
    ) -> Result<(), VerifyError> {
        let expected = match expected_checksum.map(str::trim) {
            Some(s) if !s.is_empty() => s.to_ascii_lowercase(),
            _ => return Err(VerifyError::MissingProvidedChecksum),
        };

        let actual = self.compute_with_retries(path, control).await?;

        if actual != expected {
            warn!("Checksum mismatch for {:?}: expected {}, got {}", path, expected, actual);

            if let Err(e) = delete_if_exists(path) {
                warn!("Failed to delete corrupted file {:?}: {}", path, e);
            }

            return Err(VerifyError::ChecksumMismatch {
                expected,
                actual,
            });
        }

        debug!("Checksum verified for {:?}: {}", path, actual);

        Ok(())
    }

    async fn compute_with_retries(&self, path: &Path, control: &JobListener) -> Result<String, VerifyError> {
        let mut listener = control.clone();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let result = task::spawn_blocking({
                let path: PathBuf = path.to_owned();
                let control = control.clone();
                move || md5_file(&path, &control)
            }).await.unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)));

            let error = match result {
                Ok(Some(digest)) => return Ok(digest),
                Ok(None) => return Err(VerifyError::Stopped),
                Err(e) => e,
            };

            if attempts > self.max_retries {
                return Err(VerifyError::UnableToComputeChecksum {
                    attempts,
                    source: error,
                });
            }

            debug!("Checksum attempt {} for {:?} failed: {}; retrying in {:?}",
                attempts, path, error, self.retry_delay);

            if wait(&mut listener, self.retry_delay).await == WaitResult::Stopped {
                return Err(VerifyError::Stopped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_matches::assert_matches;
    use tokio::time::Instant;

    use super::*;
    use crate::control::{job_channel, JobSignal};

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    #[test]
    fn test_md5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        let (_control, listener) = job_channel();

        fs::write(&path, b"").unwrap();
        assert_eq!(md5_file(&path, &listener).unwrap().as_deref(), Some(EMPTY_MD5));

        // Larger than one chunk
        let data = vec![b'a'; CHUNK_SIZE + 3];
        fs::write(&path, &data).unwrap();
        assert_eq!(
            md5_file(&path, &listener).unwrap(),
            Some(format!("{:x}", md5::compute(&data))),
        );
    }

    #[tokio::test]
    async fn test_case_insensitive_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ota.zip");
        fs::write(&path, b"").unwrap();
        let (_control, listener) = job_channel();

        let verifier = IntegrityVerifier::default();
        assert_matches!(verifier.verify(&path, Some("D41D8CD98F00B204E9800998ECF8427E"), &listener).await, Ok(()));
        assert_matches!(verifier.verify(&path, Some(EMPTY_MD5), &listener).await, Ok(()));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_mismatch_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ota.zip");
        fs::write(&path, b"").unwrap();
        let (_control, listener) = job_channel();

        let result = IntegrityVerifier::default()
            .verify(&path, Some("00000000000000000000000000000000"), &listener).await;

        assert_matches!(result, Err(VerifyError::ChecksumMismatch { ref actual, .. }) if actual == EMPTY_MD5);
        assert_eq!(result.unwrap_err().kind(), Some(ErrorKind::ChecksumMismatch));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-matter");
        let (_control, listener) = job_channel();
        let verifier = IntegrityVerifier::default();

        for expected in [None, Some(""), Some("  ")] {
            assert_matches!(verifier.verify(&path, expected, &listener).await,
                Err(VerifyError::MissingProvidedChecksum));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_file_retry_bound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.zip");
        let (_control, listener) = job_channel();

        let start = Instant::now();
        let result = IntegrityVerifier::default().verify(&path, Some(EMPTY_MD5), &listener).await;

        assert_matches!(result, Err(VerifyError::UnableToComputeChecksum { attempts: 6, .. }));
        // 5 delays of 2 seconds between the 6 attempts
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(12), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_appears_during_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.zip");
        let (_control, listener) = job_channel();

        let writer = tokio::spawn({
            let path = path.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                fs::write(&path, b"").unwrap();
            }
        });

        let result = IntegrityVerifier::default().verify(&path, Some(EMPTY_MD5), &listener).await;
        writer.await.unwrap();

        assert_matches!(result, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_retry_delay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.zip");
        let (control, listener) = job_channel();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            control.send(JobSignal::Stop).unwrap();
            control
        });

        let result = IntegrityVerifier::default().verify(&path, Some(EMPTY_MD5), &listener).await;
        let _control = stopper.await.unwrap();

        assert_matches!(result, Err(VerifyError::Stopped));
        assert_eq!(result.unwrap_err().kind(), None);
    }
}
