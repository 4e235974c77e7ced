//! Persistent file_dep signatures used to skip tasks whose inputs are unchanged.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::planner::Task;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSig {
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub sha256: String,
}

impl FileSig {
    fn same_stat(&self, other: &FileSig) -> bool {
        self.size == other.size
            && self.mtime_secs == other.mtime_secs
            && self.mtime_nanos == other.mtime_nanos
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TaskRecord {
    file_dep: BTreeMap<String, FileSig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    tasks: BTreeMap<String, TaskRecord>,
}

/// Signatures recorded after each successful task, keyed by task id.
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    state: Mutex<StateFile>,
}

impl StateStore {
    /// Store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StateFile::default()),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let state = match fs::read_to_string(path) {
            Ok(data) => serde_json::from_str::<StateFile>(&data).map_err(|e| {
                Error::io(format!("failed to decode task state {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => StateFile::default(),
            Err(e) => {
                return Err(Error::io(format!(
                    "failed to read task state {}: {e}",
                    path.display()
                )));
            }
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
        })
    }

    /// A task without `file_dep` and without extra checks always runs.
    pub fn is_up_to_date(&self, task: &Task) -> Result<bool> {
        if task.file_dep.is_empty() && task.uptodate.is_empty() {
            return Ok(false);
        }
        if let Some(check) = task.uptodate.iter().find(|c| !c.holds()) {
            tracing::debug!(task = %task.id, check = check.label(), "up-to-date check failed");
            return Ok(false);
        }
        if let Some(missing) = task.targets.iter().find(|t| !t.exists()) {
            tracing::debug!(task = %task.id, target = %missing.display(), "target missing");
            return Ok(false);
        }
        if task.file_dep.is_empty() {
            return Ok(true);
        }

        let state = self
            .state
            .lock()
            .map_err(|_| Error::io("task state lock poisoned"))?;
        let Some(record) = state.tasks.get(&task.id) else {
            return Ok(false);
        };
        if record.file_dep.len() != task.file_dep.len() {
            return Ok(false);
        }
        for dep in &task.file_dep {
            let Some(previous) = record.file_dep.get(&key(dep)) else {
                return Ok(false);
            };
            let Some(current) = stat(dep)? else {
                return Ok(false);
            };
            let changed = if previous.same_stat(&current) {
                false
            } else {
                sha256_file_hex(dep)? != previous.sha256
            };
            if changed {
                tracing::debug!(task = %task.id, file = %dep.display(), "file_dep changed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn record(&self, task: &Task) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::io("task state lock poisoned"))?;
        let previous = state.tasks.remove(&task.id).unwrap_or_default();

        let mut record = TaskRecord::default();
        for dep in &task.file_dep {
            let k = key(dep);
            let Some(mut sig) = stat(dep)? else {
                return Err(Error::io(format!(
                    "task '{}' depends on missing file {}",
                    task.id,
                    dep.display()
                )));
            };
            sig.sha256 = match previous.file_dep.get(&k) {
                Some(old) if old.same_stat(&sig) => old.sha256.clone(),
                _ => sha256_file_hex(dep)?,
            };
            record.file_dep.insert(k, sig);
        }
        state.tasks.insert(task.id.clone(), record);
        self.persist(&state)
    }

    pub fn forget(&self, task_id: &str) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::io("task state lock poisoned"))?;
        if state.tasks.remove(task_id).is_some() {
            self.persist(&state)?;
        }
        Ok(())
    }

    fn persist(&self, state: &StateFile) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let value = serde_json::to_value(state)
            .map_err(|e| Error::io(format!("failed to encode task state: {e}")))?;
        crate::fsutil::write_json_pretty(path, &value)
    }
}

fn key(p: &Path) -> String {
    crate::fsutil::normalize(p).to_string_lossy().into_owned()
}

fn stat(p: &Path) -> Result<Option<FileSig>> {
    let meta = match fs::metadata(p) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(format!("failed to stat {}: {e}", p.display()))),
    };
    let mtime = FileTime::from_last_modification_time(&meta);
    Ok(Some(FileSig {
        size: meta.len(),
        mtime_secs: mtime.unix_seconds(),
        mtime_nanos: mtime.nanoseconds(),
        sha256: String::new(),
    }))
}

fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut f = fs::File::open(path)
        .map_err(|e| Error::io(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    io::copy(&mut f, &mut hasher)
        .map_err(|e| Error::io(format!("failed to hash {}: {e}", path.display())))?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::UptodateCheck;

    fn task_with(dep: &Path, target: &Path) -> Task {
        Task {
            id: "image:app".into(),
            file_dep: vec![dep.to_path_buf()],
            targets: vec![target.to_path_buf()],
            ..Task::default()
        }
    }

    #[test]
    fn unchanged_inputs_are_up_to_date_across_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dep = tmp.path().join("Dockerfile");
        let target = tmp.path().join("marker");
        fs::write(&dep, b"FROM scratch\n").unwrap();
        fs::write(&target, b"").unwrap();
        let task = task_with(&dep, &target);
        let state_path = tmp.path().join("state.json");

        let store = StateStore::open(&state_path).unwrap();
        assert!(!store.is_up_to_date(&task).unwrap());
        store.record(&task).unwrap();
        assert!(store.is_up_to_date(&task).unwrap());

        let reopened = StateStore::open(&state_path).unwrap();
        assert!(reopened.is_up_to_date(&task).unwrap());
    }

    #[test]
    fn content_change_or_missing_target_reruns() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dep = tmp.path().join("Dockerfile");
        let target = tmp.path().join("marker");
        fs::write(&dep, b"FROM scratch\n").unwrap();
        fs::write(&target, b"").unwrap();
        let task = task_with(&dep, &target);
        let store = StateStore::in_memory();
        store.record(&task).unwrap();

        fs::write(&dep, b"FROM centos:7\n").unwrap();
        filetime::set_file_mtime(&dep, FileTime::from_unix_time(1, 0)).unwrap();
        assert!(!store.is_up_to_date(&task).unwrap());

        store.record(&task).unwrap();
        assert!(store.is_up_to_date(&task).unwrap());
        fs::remove_file(&target).unwrap();
        assert!(!store.is_up_to_date(&task).unwrap());
    }

    #[test]
    fn touch_without_content_change_stays_up_to_date() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dep = tmp.path().join("app.spec");
        let target = tmp.path().join("app.meta");
        fs::write(&dep, b"Name: app\n").unwrap();
        fs::write(&target, b"").unwrap();
        let task = task_with(&dep, &target);
        let store = StateStore::in_memory();
        store.record(&task).unwrap();

        filetime::set_file_mtime(&dep, FileTime::from_unix_time(42, 0)).unwrap();
        assert!(store.is_up_to_date(&task).unwrap());
    }

    #[test]
    fn tasks_without_inputs_use_their_checks() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("pkg");
        let always = Task {
            id: "always".into(),
            ..Task::default()
        };
        let mkdir = Task {
            id: "mkdir".into(),
            targets: vec![dir.clone()],
            uptodate: vec![UptodateCheck::path_exists(dir.clone())],
            ..Task::default()
        };
        let store = StateStore::in_memory();
        assert!(!store.is_up_to_date(&always).unwrap());
        assert!(!store.is_up_to_date(&mkdir).unwrap());
        fs::create_dir(&dir).unwrap();
        assert!(store.is_up_to_date(&mkdir).unwrap());
    }
}
