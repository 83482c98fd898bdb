//! Durable [`RecordStore`] on disk.
//!
//! ```text
//! <data_dir>/
//! ├── records.json               live commands, device users, devices
//! ├── commands_archive.jsonl     pruned closed commands, one per line
//! ├── checkins/2024-05-01.jsonl  punches of that day, one per line
//! └── .records.lock              advisory lock file
//! ```
//!
//! Every operation takes the in-process lock and the advisory file lock,
//! reloads what it needs, applies the same [`RecordSet`] edit the in-memory
//! store uses, and (when something changed) persists via
//! temp-file-and-rename before releasing both locks.  Reloading each time
//! keeps the files the single source of truth, so a restarted gateway, or a
//! second gateway on the same directory, picks up exactly where the other
//! left off.
//!
//! Punches never touch `records.json`: each one is appended to its day's
//! file, and the duplicate check reads only that day.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use biolink_core::domain::checkin::Checkin;
use biolink_core::{Command, Device, DeviceUser};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::{append_line, read_optional, with_file_lock, write_atomic};
use crate::application::store::{InsertOutcome, RecordSet, RecordStore, StorageError};

const RECORDS_FILE: &str = "records.json";
const ARCHIVE_FILE: &str = "commands_archive.jsonl";
const CHECKIN_DIR: &str = "checkins";
const LOCK_FILE: &str = ".records.lock";

pub struct JsonRecordStore {
    root: PathBuf,
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonRecordStore {
    /// Keeps every record file under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let root = data_dir.into();
        Self {
            path: root.join(RECORDS_FILE),
            root,
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.lock.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Runs `f` under both locks.
    fn locked<T>(&self, f: impl FnOnce() -> Result<T, StorageError>) -> Result<T, StorageError> {
        let _guard = self.guard()?;
        let lock_path = self.root.join(LOCK_FILE);
        with_file_lock(&lock_path, |source| io_error(&lock_path, source), f)
    }

    fn load(&self) -> Result<RecordSet, StorageError> {
        let bytes = read_optional(&self.path).map_err(|source| io_error(&self.path, source))?;
        match bytes {
            None => Ok(RecordSet::default()),
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn persist(&self, set: &RecordSet) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(set).map_err(|e| corrupt(&self.path, e))?;
        write_atomic(&self.path, &bytes).map_err(|source| io_error(&self.path, source))
    }

    fn read<T>(&self, f: impl FnOnce(&RecordSet) -> T) -> Result<T, StorageError> {
        self.locked(|| Ok(f(&self.load()?)))
    }

    /// Applies `f`; persists only when it reports a change.
    fn update<T>(&self, f: impl FnOnce(&mut RecordSet) -> (T, bool)) -> Result<T, StorageError> {
        self.locked(|| {
            let mut set = self.load()?;
            let (out, changed) = f(&mut set);
            if changed {
                self.persist(&set)?;
            }
            Ok(out)
        })
    }

    fn day_file(&self, checkin: &Checkin) -> PathBuf {
        self.root
            .join(CHECKIN_DIR)
            .join(format!("{}.jsonl", checkin.time.format("%Y-%m-%d")))
    }

    fn append<T: Serialize>(&self, path: &Path, record: &T) -> Result<(), StorageError> {
        let line = serde_json::to_vec(record).map_err(|e| corrupt(path, e))?;
        append_line(path, &line).map_err(|source| io_error(path, source))
    }

    /// Every day file, oldest day first.
    fn day_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let dir = self.root.join(CHECKIN_DIR);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&dir, source)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|source| io_error(&dir, source))?.path();
            if path.extension().map_or(false, |ext| ext == "jsonl") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl RecordStore for JsonRecordStore {
    fn insert_command_if_absent(&self, cmd: Command) -> Result<InsertOutcome, StorageError> {
        self.update(|set| {
            let outcome = set.insert_command_if_absent(cmd);
            let inserted = outcome.is_inserted();
            (outcome, inserted)
        })
    }

    fn get_command(&self, id: &str) -> Result<Option<Command>, StorageError> {
        self.read(|set| set.get_command(id))
    }

    fn commands(&self) -> Result<Vec<Command>, StorageError> {
        self.read(|set| set.commands.clone())
    }

    fn modify_command(
        &self,
        id: &str,
        change: &mut dyn FnMut(&mut Command),
    ) -> Result<Option<Command>, StorageError> {
        self.update(|set| {
            let before = set.get_command(id);
            let out = set.modify_command(id, change);
            let changed = out != before;
            (out, changed)
        })
    }

    fn get_user(&self, user_id: &str) -> Result<Option<DeviceUser>, StorageError> {
        self.read(|set| set.users.get(user_id).cloned())
    }

    fn upsert_user(&self, user: DeviceUser) -> Result<(), StorageError> {
        self.update(|set| ((), set.upsert_user(user)))
    }

    fn users(&self) -> Result<Vec<DeviceUser>, StorageError> {
        self.read(|set| set.users.values().cloned().collect())
    }

    fn get_device(&self, device_id: &str) -> Result<Option<Device>, StorageError> {
        self.read(|set| set.devices.get(device_id).cloned())
    }

    fn upsert_device(&self, device: Device) -> Result<(), StorageError> {
        self.update(|set| ((), set.upsert_device(device)))
    }

    fn devices(&self) -> Result<Vec<Device>, StorageError> {
        self.read(|set| set.devices.values().cloned().collect())
    }

    fn insert_checkin_if_new(&self, checkin: Checkin) -> Result<bool, StorageError> {
        self.locked(|| {
            let path = self.day_file(&checkin);
            let same_day: Vec<Checkin> = read_lines(&path)?;
            if same_day.iter().any(|c| c.is_duplicate_of(&checkin)) {
                return Ok(false);
            }
            self.append(&path, &checkin)?;
            Ok(true)
        })
    }

    fn checkins(&self) -> Result<Vec<Checkin>, StorageError> {
        self.locked(|| {
            let mut all = Vec::new();
            for path in self.day_files()? {
                all.extend(read_lines::<Checkin>(&path)?);
            }
            Ok(all)
        })
    }

    fn prune_closed_commands(&self, closed_before: DateTime<Utc>) -> Result<usize, StorageError> {
        self.locked(|| {
            let mut set = self.load()?;
            let pruned = set.take_closed_commands(closed_before);
            if pruned.is_empty() {
                return Ok(0);
            }
            let archive = self.root.join(ARCHIVE_FILE);
            for cmd in &pruned {
                self.append(&archive, cmd)?;
            }
            self.persist(&set)?;
            Ok(pruned.len())
        })
    }
}

/// Decodes one record per line.  A line that does not decode (a write torn
/// by a crash) is skipped with a warning.
fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    let Some(bytes) = read_optional(path).map_err(|source| io_error(path, source))? else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for line in bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
        match serde_json::from_slice(line) {
            Ok(record) => out.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable line"),
        }
    }
    Ok(out)
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn corrupt(path: &Path, e: serde_json::Error) -> StorageError {
    StorageError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
