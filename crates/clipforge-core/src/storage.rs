//! Durable storage for the job ledger.
//!
//! The ledger is always written whole. File writes go to a temporary file in
//! the same directory and are renamed over the target, so a crash leaves
//! either the old or the new ledger on disk, never a torn one.

use crate::error::PersistenceError;
use crate::job::Ledger;
use chrono::Utc;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Load/save of the whole ledger.
pub trait LedgerStore: Send + Sync {
    /// Loads the ledger.
    ///
    /// Jobs found in `processing` are reset to `pending` with `started_at`
    /// cleared. A missing or corrupt backing file yields an empty ledger.
    fn load(&self) -> Result<Ledger, PersistenceError>;

    /// Replaces the stored ledger with `ledger`.
    fn save(&self, ledger: &Ledger) -> Result<(), PersistenceError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Ledger stored as pretty-printed JSON in one file.
#[derive(Debug, Clone)]
pub struct JsonLedgerStore {
    path: PathBuf,
}

impl JsonLedgerStore {
    /// Creates a store backed by `path`. Nothing is read until `load`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn quarantine_corrupt(&self) {
        let mut target = self.path.clone().into_os_string();
        target.push(".corrupt");
        match fs::rename(&self.path, &target) {
            Ok(()) => warn!(path = %PathBuf::from(&target).display(), "Corrupt ledger preserved"),
            Err(e) => warn!(error = %e, "Could not preserve corrupt ledger"),
        }
    }
}

impl LedgerStore for JsonLedgerStore {
    fn load(&self) -> Result<Ledger, PersistenceError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No ledger on disk, starting empty");
                return Ok(Ledger::new());
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ledger unreadable, starting empty");
                return Ok(Ledger::new());
            }
        };

        let mut ledger = match serde_json::from_str::<Ledger>(&content) {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ledger corrupt, starting empty");
                self.quarantine_corrupt();
                return Ok(Ledger::new());
            }
        };

        ledger.normalize();
        let recovered = ledger.recover_interrupted();
        if recovered > 0 {
            info!(recovered, "Reset interrupted jobs to pending");
        }
        debug!(path = %self.path.display(), jobs = ledger.len(), "Ledger loaded");
        Ok(ledger)
    }

    fn save(&self, ledger: &Ledger) -> Result<(), PersistenceError> {
        let mut snapshot = ledger.clone();
        snapshot.last_updated = Some(Utc::now());
        let json = serde_json::to_string_pretty(&snapshot)?;
        write_atomic(&self.path, json.as_bytes())?;

        debug!(path = %self.path.display(), jobs = ledger.len(), "Ledger saved");
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Writes `bytes` to `path` through a temporary file and a rename.
///
/// Parent directories are created as needed.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
    }

    let file_name = path
        .file_name()
        .map_or_else(|| "state".to_string(), |n| n.to_string_lossy().into_owned());
    let temp_path = path.with_file_name(format!(".{}.tmp.{}", file_name, uuid::Uuid::new_v4()));

    // Write to file atomically (write to temp, then rename)
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&temp_path);
        return Err(PersistenceError::io(&temp_path, e));
    }
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(PersistenceError::io(path, e));
    }
    Ok(())
}

/// Ledger kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    ledger: Mutex<Option<Ledger>>,
}

impl MemoryLedgerStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `ledger`, as if saved earlier.
    pub fn with_ledger(ledger: Ledger) -> Self {
        Self { ledger: Mutex::new(Some(ledger)) }
    }

    /// Number of jobs in the last saved ledger.
    pub fn saved_len(&self) -> usize {
        self.ledger.lock().ok().and_then(|l| l.as_ref().map(Ledger::len)).unwrap_or_default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<Ledger, PersistenceError> {
        let mut ledger = self.ledger.lock().ok().and_then(|l| l.clone()).unwrap_or_default();
        ledger.recover_interrupted();
        Ok(ledger)
    }

    fn save(&self, ledger: &Ledger) -> Result<(), PersistenceError> {
        if let Ok(mut slot) = self.ledger.lock() {
            *slot = Some(ledger.clone());
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobRequest, JobStatus};
    use clipforge_abstraction::GenerationOutput;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_ledger() -> Ledger {
        let mut ledger = Ledger::new();
        let mut request = JobRequest::new("a.png", "dolly zoom", "kling_21_master").with_priority(4);
        request.parameters.duration_secs = Some(10);
        request.parameters.extra.insert("seed".to_string(), json!(7));
        let done = ledger.insert(Job::new(request, 2, 1.4, None));
        ledger.insert(Job::new(JobRequest::new("b.png", "tilt", "mystery"), 2, 0.0, Some("unknown backend".to_string())));

        let job = ledger.get_mut(&done).unwrap();
        job.start(Utc::now()).unwrap();
        job.complete(
            GenerationOutput { payload: json!({"video": "out.mp4"}), actual_cost: Some(1.25), ..Default::default() },
            Utc::now(),
        )
        .unwrap();
        ledger
    }

    #[test]
    fn test_missing_file_is_empty_ledger() {
        let dir = TempDir::new().unwrap();
        let store = JsonLedgerStore::new(dir.path().join("ledger.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_preserves_jobs() {
        let dir = TempDir::new().unwrap();
        let store = JsonLedgerStore::new(dir.path().join("nested").join("ledger.json"));
        let ledger = sample_ledger();
        store.save(&ledger).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.jobs(), ledger.jobs());
        assert_eq!(loaded.next_sequence, ledger.next_sequence);
        assert!(loaded.last_updated.is_some());
    }

    #[test]
    fn test_round_trip_keeps_empty_generation_result() {
        let dir = TempDir::new().unwrap();
        let store = JsonLedgerStore::new(dir.path().join("ledger.json"));
        let mut ledger = Ledger::new();
        let id = ledger.insert(Job::new(JobRequest::new("a.png", "pan", "kling_21_standard"), 0, 0.5, None));
        let job = ledger.get_mut(&id).unwrap();
        job.start(Utc::now()).unwrap();
        job.complete(GenerationOutput::default(), Utc::now()).unwrap();
        store.save(&ledger).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.jobs(), ledger.jobs());
        let job = loaded.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({})));
        assert!(job.error_message.is_none());
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = JsonLedgerStore::new(dir.path().join("ledger.json"));
        store.save(&sample_ledger()).unwrap();
        store.save(&sample_ledger()).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["ledger.json".to_string()]);
    }

    #[test]
    fn test_corrupt_file_is_empty_and_preserved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        fs::write(&path, "{ not json").unwrap();

        let store = JsonLedgerStore::new(&path);
        assert!(store.load().unwrap().is_empty());
        assert!(dir.path().join("ledger.json.corrupt").exists());
    }

    #[test]
    fn test_load_resets_processing_jobs() {
        let dir = TempDir::new().unwrap();
        let store = JsonLedgerStore::new(dir.path().join("ledger.json"));
        let mut ledger = Ledger::new();
        let id = ledger.insert(Job::new(JobRequest::new("a.png", "pan", "luma_dream"), 2, 0.5, None));
        ledger.get_mut(&id).unwrap().start(Utc::now()).unwrap();
        store.save(&ledger).unwrap();

        let loaded = store.load().unwrap();
        let job = loaded.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_memory_store_recovers_too() {
        let mut ledger = Ledger::new();
        let id = ledger.insert(Job::new(JobRequest::new("a.png", "pan", "luma_dream"), 2, 0.5, None));
        ledger.get_mut(&id).unwrap().start(Utc::now()).unwrap();

        let store = MemoryLedgerStore::with_ledger(ledger);
        assert_eq!(store.load().unwrap().get(&id).unwrap().status, JobStatus::Pending);
        assert_eq!(store.saved_len(), 1);
    }
}
