//! Durable record of an in-progress transfer.
//!
//! The checkpoint is stored as a handful of flat key/value pairs in a
//! [`PreferenceStore`]. The key names and value formats are shared with other
//! consumers of the store, so they must not change:
//!
//! | Key                    | Type   | Description                                |
//! |------------------------|--------|--------------------------------------------|
//! | `downloaderState`      | string | [`DownloadState`] name                     |
//! | `bytesDownloadedSoFar` | long   | Resume offset (absent while verifying)     |
//! | `downloadWorkId`       | string | Identifier of the job owning the transfer  |
//! | `transitionHistory`    | string | Comma-joined `<timestamp>\|<from>-><to>`   |
//! | `artifact`             | string | JSON encoded [`ArtifactMetadata`]          |

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    artifact::ArtifactMetadata,
    file::add_extension,
    state::{format_history, parse_history, DownloadState, ParseStateError, ParseTransitionError, Transition},
};

pub const KEY_STATE: &str = "downloaderState";
pub const KEY_BYTES: &str = "bytesDownloadedSoFar";
pub const KEY_WORK_ID: &str = "downloadWorkId";
pub const KEY_HISTORY: &str = "transitionHistory";
pub const KEY_ARTIFACT: &str = "artifact";

const ALL_KEYS: [&str; 5] = [KEY_STATE, KEY_BYTES, KEY_WORK_ID, KEY_HISTORY, KEY_ARTIFACT];

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Could not parse preference data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Bad value for key '{0}': {1}")]
    BadValue(&'static str, String),
    #[error(transparent)]
    BadState(#[from] ParseStateError),
    #[error(transparent)]
    BadHistory(#[from] ParseTransitionError),
}

/// A value in a [`PreferenceStore`].
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PrefValue {
    Long(i64),
    String(String),
}

/// Minimal string/long key-value persistence. Writes may be buffered until
/// [`PreferenceStore::commit`] is called.
pub trait PreferenceStore: Send {
    fn get_string(&self, key: &str) -> Option<String>;

    fn put_string(&mut self, key: &str, value: &str);

    fn get_long(&self, key: &str) -> Option<i64>;

    fn put_long(&mut self, key: &str, value: i64);

    fn remove(&mut self, key: &str);

    /// Make all previous writes durable.
    fn commit(&mut self) -> io::Result<()>;
}

/// In-memory store. Clones share the same underlying map, which allows one
/// handle to be given away while another is kept for inspection.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<BTreeMap<String, PrefValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_values(values: BTreeMap<String, PrefValue>) -> Self {
        Self {
            values: Arc::new(Mutex::new(values)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().unwrap().is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.lock().unwrap().contains_key(key)
    }

    fn snapshot(&self) -> BTreeMap<String, PrefValue> {
        self.values.lock().unwrap().clone()
    }
}

impl PreferenceStore for MemoryStore {
    fn get_string(&self, key: &str) -> Option<String> {
        match self.values.lock().unwrap().get(key) {
            Some(PrefValue::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn put_string(&mut self, key: &str, value: &str) {
        self.values.lock().unwrap().insert(key.to_owned(), PrefValue::String(value.to_owned()));
    }

    fn get_long(&self, key: &str) -> Option<i64> {
        match self.values.lock().unwrap().get(key) {
            Some(PrefValue::Long(n)) => Some(*n),
            _ => None,
        }
    }

    fn put_long(&mut self, key: &str, value: i64) {
        self.values.lock().unwrap().insert(key.to_owned(), PrefValue::Long(value));
    }

    fn remove(&mut self, key: &str) {
        self.values.lock().unwrap().remove(key);
    }

    fn commit(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Store backed by a JSON object on disk. Commits write a temporary sibling
/// and rename it over the original so that a crash never leaves a truncated
/// file behind.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: MemoryStore,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file is treated as an empty store.
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        let values = match File::open(path) {
            Ok(f) => serde_json::from_reader(io::BufReader::new(f))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No preference file at {:?}", path);
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_owned(),
            values: MemoryStore::with_values(values),
        })
    }
}

impl PreferenceStore for JsonFileStore {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values.get_string(key)
    }

    fn put_string(&mut self, key: &str, value: &str) {
        self.values.put_string(key, value)
    }

    fn get_long(&self, key: &str) -> Option<i64> {
        self.values.get_long(key)
    }

    fn put_long(&mut self, key: &str, value: i64) {
        self.values.put_long(key, value)
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key)
    }

    fn commit(&mut self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = add_extension(&self.path, "tmp");
        let data = serde_json::to_vec_pretty(&self.values.snapshot())?;

        trace!("Writing {} bytes of preferences to {:?}", data.len(), temp_path);

        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)
    }
}

/// Persisted transfer state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub state: DownloadState,
    /// Bytes written to the partial file. Always zero while verifying since
    /// verification cannot be resumed.
    pub bytes_downloaded: u64,
    pub work_id: String,
    pub history: Vec<Transition>,
    pub artifact: Option<ArtifactMetadata>,
}

impl Checkpoint {
    /// Offset from which the transfer can be resumed.
    pub fn resume_offset(&self) -> u64 {
        if self.state == DownloadState::Verifying {
            0
        } else {
            self.bytes_downloaded
        }
    }
}

/// Typed access to the checkpoint keys of a [`PreferenceStore`].
pub struct CheckpointStore {
    prefs: Box<dyn PreferenceStore>,
}

impl CheckpointStore {
    pub fn new(prefs: Box<dyn PreferenceStore>) -> Self {
        Self {
            prefs,
        }
    }

    /// Load the checkpoint, if one exists.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let state = match self.prefs.get_string(KEY_STATE) {
            Some(s) => s.parse::<DownloadState>()?,
            None => return Ok(None),
        };

        let bytes_downloaded = match self.prefs.get_long(KEY_BYTES) {
            Some(n) => u64::try_from(n)
                .map_err(|_| CheckpointError::BadValue(KEY_BYTES, n.to_string()))?,
            None => 0,
        };

        let history = match self.prefs.get_string(KEY_HISTORY) {
            Some(s) => parse_history(&s)?,
            None => vec![],
        };

        let artifact = match self.prefs.get_string(KEY_ARTIFACT) {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        };

        Ok(Some(Checkpoint {
            state,
            bytes_downloaded,
            work_id: self.prefs.get_string(KEY_WORK_ID).unwrap_or_default(),
            history,
            artifact,
        }))
    }

    pub fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        trace!("Saving checkpoint: {:?}", checkpoint);

        self.prefs.put_string(KEY_STATE, checkpoint.state.as_str());

        if checkpoint.state == DownloadState::Verifying {
            self.prefs.remove(KEY_BYTES);
        } else {
            self.prefs.put_long(KEY_BYTES, to_long(checkpoint.bytes_downloaded)?);
        }

        self.prefs.put_string(KEY_WORK_ID, &checkpoint.work_id);
        self.prefs.put_string(KEY_HISTORY, &format_history(&checkpoint.history));

        match &checkpoint.artifact {
            Some(a) => self.prefs.put_string(KEY_ARTIFACT, &serde_json::to_string(a)?),
            None => self.prefs.remove(KEY_ARTIFACT),
        }

        self.prefs.commit()?;

        Ok(())
    }

    /// Update only the resume offset. This is the hot path during transfers.
    pub fn save_offset(&mut self, bytes_downloaded: u64) -> Result<(), CheckpointError> {
        self.prefs.put_long(KEY_BYTES, to_long(bytes_downloaded)?);
        self.prefs.commit()?;

        Ok(())
    }

    /// Delete the checkpoint entirely.
    pub fn clear(&mut self) -> Result<(), CheckpointError> {
        debug!("Clearing checkpoint");

        for key in ALL_KEYS {
            self.prefs.remove(key);
        }
        self.prefs.commit()?;

        Ok(())
    }
}

fn to_long(value: u64) -> Result<i64, CheckpointError> {
    i64::try_from(value).map_err(|_| CheckpointError::BadValue(KEY_BYTES, value.to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn checkpoint(state: DownloadState, bytes: u64) -> Checkpoint {
        Checkpoint {
            state,
            bytes_downloaded: bytes,
            work_id: "transfer-1".to_owned(),
            history: vec![Transition {
                timestamp_millis: 5,
                from: DownloadState::Idle,
                to: DownloadState::Queued,
            }],
            artifact: Some(ArtifactMetadata {
                download_url: "https://example.com/ota.zip".to_owned(),
                filename: "ota.zip".to_owned(),
                expected_size: 1000,
                expected_checksum: "abc".to_owned(),
                version_label: "2.0".to_owned(),
            }),
        }
    }

    #[test]
    fn test_save_load_clear() {
        let prefs = MemoryStore::new();
        let mut store = CheckpointStore::new(Box::new(prefs.clone()));

        assert_matches!(store.load(), Ok(None));

        let cp = checkpoint(DownloadState::Downloading, 400);
        store.save(&cp).unwrap();

        assert_eq!(prefs.get_string(KEY_STATE).as_deref(), Some("DOWNLOADING"));
        assert_eq!(prefs.get_long(KEY_BYTES), Some(400));
        assert_eq!(prefs.get_string(KEY_HISTORY).as_deref(), Some("5|IDLE->QUEUED"));
        assert_eq!(store.load().unwrap(), Some(cp));

        store.save_offset(600).unwrap();
        assert_eq!(store.load().unwrap().unwrap().bytes_downloaded, 600);

        store.clear().unwrap();
        assert!(prefs.is_empty());
        assert_matches!(store.load(), Ok(None));
    }

    #[test]
    fn test_verifying_has_no_offset() {
        let prefs = MemoryStore::new();
        let mut store = CheckpointStore::new(Box::new(prefs.clone()));

        store.save(&checkpoint(DownloadState::Verifying, 1000)).unwrap();

        assert!(!prefs.contains_key(KEY_BYTES));

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.bytes_downloaded, 0);
        assert_eq!(loaded.resume_offset(), 0);
    }

    #[test]
    fn test_bad_values() {
        let mut prefs = MemoryStore::new();
        let store = CheckpointStore::new(Box::new(prefs.clone()));

        prefs.put_string(KEY_STATE, "SOMETHING");
        assert_matches!(store.load(), Err(CheckpointError::BadState(_)));

        prefs.put_string(KEY_STATE, "PAUSED");
        prefs.put_long(KEY_BYTES, -1);
        assert_matches!(store.load(), Err(CheckpointError::BadValue(KEY_BYTES, _)));
    }

    #[test]
    fn test_json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        {
            let prefs = JsonFileStore::open(&path).unwrap();
            let mut store = CheckpointStore::new(Box::new(prefs));
            store.save(&checkpoint(DownloadState::Paused, 123)).unwrap();
        }

        assert!(path.exists());
        assert!(!add_extension(&path, "tmp").exists());

        let prefs = JsonFileStore::open(&path).unwrap();
        assert_eq!(prefs.get_long(KEY_BYTES), Some(123));
        assert_eq!(prefs.get_string(KEY_STATE).as_deref(), Some("PAUSED"));

        let store = CheckpointStore::new(Box::new(prefs));
        assert_eq!(store.load().unwrap(), Some(checkpoint(DownloadState::Paused, 123)));
    }

    #[test]
    fn test_json_file_store_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();

        assert_matches!(JsonFileStore::open(&path), Err(CheckpointError::Json(_)));
    }
}
