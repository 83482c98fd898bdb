//! File-backed [`SessionStore`] for block reassembly.
//!
//! ```text
//! <data_dir>/
//! ├── block_sequence_map.json      {"DEV1_realtime_glog": 3, ...}
//! └── partial_data/
//!     └── DEV1_realtime_glog.bin   bytes of blocks 1..=3
//! ```
//!
//! The map is the source of truth for whether a session exists.  Every
//! operation holds the process lock and an advisory lock on
//! `.sessions.lock` from the first read to the last write, so sessions
//! survive restarts and concurrent requests for the same key never
//! interleave, even across processes.
//!
//! An append that cannot record its block in the map is cut back off the
//! partial file, so the bytes on disk always match the map.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use biolink_core::protocol::reassembly::AppendOutcome;
use biolink_core::protocol::SessionStoreError;
use biolink_core::{SessionKey, SessionStore};
use tracing::warn;

use super::{read_optional, with_file_lock, write_atomic};

const MAP_FILE: &str = "block_sequence_map.json";
const PARTIAL_DIR: &str = "partial_data";
const LOCK_FILE: &str = ".sessions.lock";

type SequenceMap = BTreeMap<String, u32>;

pub struct FileSessionStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionStore {
    /// Uses `root` (created on first write) as the data directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, SessionStoreError> {
        self.lock
            .lock()
            .map_err(|_| SessionStoreError("session lock poisoned".to_string()))
    }

    /// Runs `f` under the process lock and the directory's file lock.
    fn locked<T>(
        &self,
        f: impl FnOnce() -> Result<T, SessionStoreError>,
    ) -> Result<T, SessionStoreError> {
        let _guard = self.guard()?;
        let lock_path = self.root.join(LOCK_FILE);
        with_file_lock(&lock_path, |e| io_error(&lock_path, e), f)
    }

    fn map_path(&self) -> PathBuf {
        self.root.join(MAP_FILE)
    }

    fn partial_path(&self, key: &SessionKey) -> PathBuf {
        self.root
            .join(PARTIAL_DIR)
            .join(format!("{}.bin", file_safe(&key.storage_name())))
    }

    fn load_map(&self) -> Result<SequenceMap, SessionStoreError> {
        let path = self.map_path();
        match read_optional(&path).map_err(|e| io_error(&path, e))? {
            None => Ok(SequenceMap::new()),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SessionStoreError(format!("{} is corrupt: {e}", path.display()))),
        }
    }

    fn save_map(&self, map: &SequenceMap) -> Result<(), SessionStoreError> {
        let path = self.map_path();
        let bytes = serde_json::to_vec_pretty(map)
            .map_err(|e| SessionStoreError(format!("cannot encode sequence map: {e}")))?;
        write_atomic(&path, &bytes).map_err(|e| io_error(&path, e))
    }
}

impl SessionStore for FileSessionStore {
    fn restart(&self, key: &SessionKey, chunk: &[u8]) -> Result<(), SessionStoreError> {
        self.locked(|| {
            let partial = self.partial_path(key);
            write_atomic(&partial, chunk).map_err(|e| io_error(&partial, e))?;

            let mut map = self.load_map()?;
            map.insert(key.storage_name(), 1);
            self.save_map(&map)
        })
    }

    fn append_next(
        &self,
        key: &SessionKey,
        block: u32,
        chunk: &[u8],
    ) -> Result<AppendOutcome, SessionStoreError> {
        self.locked(|| {
            let mut map = self.load_map()?;
            let name = key.storage_name();

            let last = map.get(&name).copied();
            if last.and_then(|l| l.checked_add(1)) != Some(block) {
                return Ok(AppendOutcome::Mismatch { last });
            }

            map.insert(name, block);
            append_then(&self.partial_path(key), chunk, || self.save_map(&map))?;
            Ok(AppendOutcome::Appended)
        })
    }

    fn complete(
        &self,
        key: &SessionKey,
        chunk: &[u8],
    ) -> Result<Option<Vec<u8>>, SessionStoreError> {
        self.locked(|| {
            let mut map = self.load_map()?;
            if map.remove(&key.storage_name()).is_none() {
                return Ok(None);
            }

            let partial = self.partial_path(key);
            let mut buffer = read_optional(&partial)
                .map_err(|e| io_error(&partial, e))?
                .unwrap_or_default();
            buffer.extend_from_slice(chunk);

            self.save_map(&map)?;
            match std::fs::remove_file(&partial) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&partial, e)),
            }
            Ok(Some(buffer))
        })
    }

    fn last_block(&self, key: &SessionKey) -> Result<Option<u32>, SessionStoreError> {
        self.locked(|| Ok(self.load_map()?.get(&key.storage_name()).copied()))
    }
}

/// Appends `chunk` to `path`, then runs `commit`.  If either step fails the
/// file is cut back to its previous length.
fn append_then(
    path: &Path,
    chunk: &[u8],
    commit: impl FnOnce() -> Result<(), SessionStoreError>,
) -> Result<(), SessionStoreError> {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| io_error(path, e))?;
    let kept_len = file.metadata().map_err(|e| io_error(path, e))?.len();

    let result = file
        .write_all(chunk)
        .map_err(|e| io_error(path, e))
        .and_then(|()| commit());
    if result.is_err() {
        if let Err(cut) = file.set_len(kept_len) {
            warn!(path = %path.display(), error = %cut, "cannot cut back partial file");
        }
    }
    result
}

fn io_error(path: &Path, e: std::io::Error) -> SessionStoreError {
    SessionStoreError(format!("{}: {e}", path.display()))
}

/// Percent-escapes everything outside `[A-Za-z0-9_-]` so a device id can
/// never leave `partial_data/`.
fn file_safe(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
