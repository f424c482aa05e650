//! Registry of background containers.
//!
//! One JSON file per container under the state directory. Records are only
//! ever created by an atomic no-clobber link and replaced by an atomic
//! rename, so concurrent invocations never observe a partial record.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Error, LifecycleError, Result};

/// Overrides the state directory.
pub const STATE_DIR_ENV: &str = "MUN_OS_STATE_DIR";
const RECORD_EXTENSION: &str = "json";
/// Records stay readable for unprivileged `list` after a privileged `start`.
const RECORD_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Starting => "starting",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub name: String,
    /// Host pid of the container's init process.
    pub pid: i32,
    /// Kernel start time of `pid` in clock ticks since boot. Together with the
    /// pid it identifies the process; a reused pid has a different start time.
    #[serde(default)]
    pub start_time: u64,
    pub cgroup_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub status: ContainerStatus,
    pub hostname: String,
    /// Config file the container was started from.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

/// Checks that `name` can be used as a record key and a cgroup name.
pub fn validate_name(name: &str) -> Result<()> {
    let re = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$")
        .map_err(|e| Error::config(e.to_string()))?;
    if !re.is_match(name) {
        return Err(Error::config(format!(
            "invalid container name '{}': use up to 64 letters, digits, '_', '.' or '-'",
            name
        )));
    }
    Ok(())
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StateStore { dir: dir.into() }
    }

    /// `$MUN_OS_STATE_DIR`, or `~/.mun-os/state`.
    pub fn open_default() -> Result<Self> {
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(dir));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            Error::config(format!(
                "cannot locate the home directory; set {}",
                STATE_DIR_ENV
            ))
        })?;
        Ok(Self::new(home.join(".mun-os").join("state")))
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, RECORD_EXTENSION))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.record_path(name).exists()
    }

    /// Inserts a new record. Fails with `DuplicateName` if one exists.
    pub fn create(&self, record: &ContainerRecord) -> Result<()> {
        validate_name(&record.name)?;
        let path = self.record_path(&record.name);
        let staged = self.stage(record)?;
        staged.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                LifecycleError::DuplicateName(record.name.clone()).into()
            } else {
                Error::state_store(&path, e.error)
            }
        })?;
        tracing::debug!(name = %record.name, path = %path.display(), "record created");
        Ok(())
    }

    /// Replaces an existing record.
    pub fn update(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.record_path(&record.name);
        if !path.exists() {
            return Err(LifecycleError::NotFound(record.name.clone()).into());
        }
        let staged = self.stage(record)?;
        staged
            .persist(&path)
            .map_err(|e| Error::state_store(&path, e.error))?;
        tracing::debug!(name = %record.name, status = %record.status, "record updated");
        Ok(())
    }

    pub fn read(&self, name: &str) -> Result<Option<ContainerRecord>> {
        let path = self.record_path(name);
        match fs::read_to_string(&path) {
            Ok(text) => parse_record(&path, &text).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::state_store(path, e)),
        }
    }

    /// All records sorted by name. A missing directory is an empty store.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::state_store(&self.dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::state_store(&self.dir, e))?;
            let path = entry.path();
            let is_record = path.extension().is_some_and(|ext| ext == RECORD_EXTENSION)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            // the file can disappear between read_dir and read
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::state_store(path, e)),
            };
            match parse_record(&path, &text) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Removes a record. Returns `false` if there was none.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(name, "record deleted");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::state_store(path, e)),
        }
    }

    /// Writes `record` to a hidden temp file in the state directory.
    fn stage(&self, record: &ContainerRecord) -> Result<NamedTempFile> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::state_store(&self.dir, e))?;
        let mut staged = NamedTempFile::new_in(&self.dir).map_err(|e| Error::state_store(&self.dir, e))?;
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::state_store(staged.path(), e.into()))?;
        staged
            .write_all(&json)
            .and_then(|_| {
                staged
                    .as_file()
                    .set_permissions(fs::Permissions::from_mode(RECORD_MODE))
            })
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|e| Error::state_store(staged.path(), e))?;
        Ok(staged)
    }
}

fn parse_record(path: &Path, text: &str) -> Result<ContainerRecord> {
    serde_json::from_str(text).map_err(|e| Error::state_store(path, e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ContainerRecord {
        ContainerRecord {
            name: name.to_string(),
            pid: 4242,
            start_time: 123456,
            cgroup_path: PathBuf::from("/sys/fs/cgroup/mun-os").join(name),
            created_at: Utc::now(),
            status: ContainerStatus::Running,
            hostname: "sleepy-container".into(),
            config_path: Some(PathBuf::from("/configs/test_sleep.json")),
        }
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("does/not/exist"));
        assert!(store.list().unwrap().is_empty());
        assert!(store.read("test_sleep").unwrap().is_none());
    }

    #[test]
    fn test_create_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));

        let rec = record("test_sleep");
        store.create(&rec).unwrap();
        assert!(store.contains("test_sleep"));
        assert_eq!(store.read("test_sleep").unwrap(), Some(rec.clone()));
        assert_eq!(store.list().unwrap(), vec![rec]);

        assert!(store.delete("test_sleep").unwrap());
        assert!(!store.delete("test_sleep").unwrap());
        assert!(store.list().unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path().join("state")).unwrap().count(), 0);
    }

    #[test]
    fn test_create_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.create(&record("web")).unwrap();

        let mut other = record("web");
        other.pid = 1;
        let err = store.create(&other).unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::DuplicateName(ref n)) if n == "web"
        ));
        assert_eq!(store.read("web").unwrap().unwrap().pid, 4242);
        // the rejected temp file does not linger
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_update_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut rec = record("web");
        rec.status = ContainerStatus::Starting;
        store.create(&rec).unwrap();

        rec.status = ContainerStatus::Stopping;
        store.update(&rec).unwrap();
        assert_eq!(
            store.read("web").unwrap().unwrap().status,
            ContainerStatus::Stopping
        );

        store.delete("web").unwrap();
        assert!(matches!(
            store.update(&rec),
            Err(Error::Lifecycle(LifecycleError::NotFound(_)))
        ));
    }

    #[test]
    fn test_list_sorted_and_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.create(&record("zeta")).unwrap();
        store.create(&record("alpha")).unwrap();
        fs::write(dir.path().join(".tmpabc123"), "{").unwrap();
        fs::write(dir.path().join("broken.json"), "not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_records_are_world_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut rec = record("test_sleep");
        store.create(&rec).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        let path = dir.path().join("test_sleep.json");
        assert_eq!(mode(&path), 0o644);

        rec.status = ContainerStatus::Stopping;
        store.update(&rec).unwrap();
        assert_eq!(mode(&path), 0o644);
    }

    #[test]
    fn test_record_without_start_time() {
        let json = r#"{"name": "old", "pid": 7, "cgroup_path": "/sys/fs/cgroup/mun-os/old",
            "created_at": "2026-01-01T00:00:00Z", "status": "running", "hostname": "h"}"#;
        let rec: ContainerRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.start_time, 0);
        assert_eq!(rec.config_path, None);
    }

    #[test]
    fn test_record_json_format() {
        let json = serde_json::to_value(record("web")).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["pid"], 4242);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("test_sleep").is_ok());
        assert!(validate_name("web-1.v2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }
}
