//! Storage abstractions used by the gateway use cases.
//!
//! Every cross-request fact (commands, device users, devices, check-ins,
//! templates) lives behind one of the traits below.  Each trait method is a
//! single atomic operation: implementations hold their lock for the whole
//! check-then-write so two concurrent requests never observe a half-applied
//! change.  This is what makes command dedup race-free.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use biolink_core::domain::checkin::Checkin;
use biolink_core::protocol::SessionStoreError;
use biolink_core::{Command, Device, DeviceUser, EnrollmentBlob, Vendor};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a durable store.  Surfaced to devices as a 500-class reply.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A store file exists but could not be decoded.
    #[error("corrupt store file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A key would escape the store directory or is otherwise unusable as a
    /// file name.
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),

    /// A thread panicked while holding the store lock.
    #[error("store lock poisoned")]
    Poisoned,

    /// A store call on the blocking pool panicked or was cancelled.
    #[error("store task failed: {0}")]
    TaskFailed(String),

    /// The reassembly session store failed.
    #[error(transparent)]
    Session(#[from] SessionStoreError),
}

/// Result of [`RecordStore::insert_command_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The command was stored.
    Inserted(Command),
    /// An equivalent pending command already existed; nothing was stored.
    Duplicate(Command),
}

impl InsertOutcome {
    pub fn command(&self) -> &Command {
        match self {
            InsertOutcome::Inserted(cmd) | InsertOutcome::Duplicate(cmd) => cmd,
        }
    }

    pub fn into_command(self) -> Command {
        match self {
            InsertOutcome::Inserted(cmd) | InsertOutcome::Duplicate(cmd) => cmd,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// Create/read/update access to commands, device users, devices and
/// check-ins.
pub trait RecordStore: Send + Sync {
    /// Stores `cmd` unless a pending command for the same (device, user,
    /// vendor, kind) exists.  The check and the insert are one atomic step.
    fn insert_command_if_absent(&self, cmd: Command) -> Result<InsertOutcome, StorageError>;

    fn get_command(&self, id: &str) -> Result<Option<Command>, StorageError>;

    /// All commands, in insertion order.
    fn commands(&self) -> Result<Vec<Command>, StorageError>;

    /// Applies `change` to the stored command atomically and returns the
    /// updated copy, or `None` if no such command exists.
    fn modify_command(
        &self,
        id: &str,
        change: &mut dyn FnMut(&mut Command),
    ) -> Result<Option<Command>, StorageError>;

    fn get_user(&self, user_id: &str) -> Result<Option<DeviceUser>, StorageError>;

    fn upsert_user(&self, user: DeviceUser) -> Result<(), StorageError>;

    fn users(&self) -> Result<Vec<DeviceUser>, StorageError>;

    fn get_device(&self, device_id: &str) -> Result<Option<Device>, StorageError>;

    fn upsert_device(&self, device: Device) -> Result<(), StorageError>;

    fn devices(&self) -> Result<Vec<Device>, StorageError>;

    /// Stores `checkin` unless a duplicate exists.  Returns `true` if stored.
    fn insert_checkin_if_new(&self, checkin: Checkin) -> Result<bool, StorageError>;

    fn checkins(&self) -> Result<Vec<Checkin>, StorageError>;

    /// Drops `Success`/`Failed` commands closed before `closed_before` from
    /// the live set and returns how many went.  Pending commands are never
    /// touched, so dedup is unaffected.
    fn prune_closed_commands(&self, closed_before: DateTime<Utc>) -> Result<usize, StorageError>;

    /// Pending commands for `device_id`, in insertion order.
    fn pending_commands(&self, device_id: &str) -> Result<Vec<Command>, StorageError> {
        Ok(self
            .commands()?
            .into_iter()
            .filter(|c| c.is_pending() && c.device_id == device_id)
            .collect())
    }
}

/// Enrollment template storage, one blob per (user, vendor).
pub trait BlobStore: Send + Sync {
    fn get_template(
        &self,
        user_id: &str,
        vendor: Vendor,
    ) -> Result<Option<EnrollmentBlob>, StorageError>;

    fn put_template(&self, user_id: &str, blob: &EnrollmentBlob) -> Result<(), StorageError>;
}

/// Source of "now".  Injected so lifecycle tests can move time forward.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Wall-clock time in the server's local zone; terminals report
    /// attendance in local time.
    fn local_now(&self) -> NaiveDateTime;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|p| *p.into_inner())
    }

    fn local_now(&self) -> NaiveDateTime {
        self.now().naive_utc()
    }
}

// ── Record set ────────────────────────────────────────────────────────────────

/// Every record the gateway keeps, as one serializable value.
///
/// The operations here are plain in-memory edits.  Store implementations
/// wrap a `RecordSet` in a lock (and, for the durable store, reload and
/// persist it around each mutation).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSet {
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub users: BTreeMap<String, DeviceUser>,
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkins: Vec<Checkin>,
}

impl RecordSet {
    pub fn insert_command_if_absent(&mut self, cmd: Command) -> InsertOutcome {
        if let Some(existing) = self.commands.iter().find(|c| {
            c.is_pending_duplicate_of(&cmd.device_id, &cmd.user_id, cmd.vendor, cmd.kind)
        }) {
            return InsertOutcome::Duplicate(existing.clone());
        }
        self.commands.push(cmd.clone());
        InsertOutcome::Inserted(cmd)
    }

    pub fn get_command(&self, id: &str) -> Option<Command> {
        self.commands.iter().find(|c| c.id == id).cloned()
    }

    pub fn modify_command(
        &mut self,
        id: &str,
        change: &mut dyn FnMut(&mut Command),
    ) -> Option<Command> {
        let cmd = self.commands.iter_mut().find(|c| c.id == id)?;
        change(cmd);
        Some(cmd.clone())
    }

    /// Returns `false` when the stored user is already identical.
    pub fn upsert_user(&mut self, user: DeviceUser) -> bool {
        if self.users.get(&user.user_id) == Some(&user) {
            return false;
        }
        self.users.insert(user.user_id.clone(), user);
        true
    }

    /// Returns `false` when the stored device is already identical.
    pub fn upsert_device(&mut self, device: Device) -> bool {
        if self.devices.get(&device.id) == Some(&device) {
            return false;
        }
        self.devices.insert(device.id.clone(), device);
        true
    }

    /// Removes and returns terminal commands closed before `closed_before`.
    pub fn take_closed_commands(&mut self, closed_before: DateTime<Utc>) -> Vec<Command> {
        let (old, live): (Vec<Command>, Vec<Command>) = std::mem::take(&mut self.commands)
            .into_iter()
            .partition(|c| !c.is_pending() && c.closed_at.map_or(false, |t| t < closed_before));
        self.commands = live;
        old
    }

    pub fn insert_checkin_if_new(&mut self, checkin: Checkin) -> bool {
        if self.checkins.iter().any(|c| c.is_duplicate_of(&checkin)) {
            return false;
        }
        self.checkins.push(checkin);
        true
    }
}

// ── In-process stores ─────────────────────────────────────────────────────────

/// [`RecordStore`] kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<RecordSet>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RecordSet>, StorageError> {
        self.records.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert_command_if_absent(&self, cmd: Command) -> Result<InsertOutcome, StorageError> {
        Ok(self.lock()?.insert_command_if_absent(cmd))
    }

    fn get_command(&self, id: &str) -> Result<Option<Command>, StorageError> {
        Ok(self.lock()?.get_command(id))
    }

    fn commands(&self) -> Result<Vec<Command>, StorageError> {
        Ok(self.lock()?.commands.clone())
    }

    fn modify_command(
        &self,
        id: &str,
        change: &mut dyn FnMut(&mut Command),
    ) -> Result<Option<Command>, StorageError> {
        Ok(self.lock()?.modify_command(id, change))
    }

    fn get_user(&self, user_id: &str) -> Result<Option<DeviceUser>, StorageError> {
        Ok(self.lock()?.users.get(user_id).cloned())
    }

    fn upsert_user(&self, user: DeviceUser) -> Result<(), StorageError> {
        self.lock()?.upsert_user(user);
        Ok(())
    }

    fn users(&self) -> Result<Vec<DeviceUser>, StorageError> {
        Ok(self.lock()?.users.values().cloned().collect())
    }

    fn get_device(&self, device_id: &str) -> Result<Option<Device>, StorageError> {
        Ok(self.lock()?.devices.get(device_id).cloned())
    }

    fn upsert_device(&self, device: Device) -> Result<(), StorageError> {
        self.lock()?.upsert_device(device);
        Ok(())
    }

    fn devices(&self) -> Result<Vec<Device>, StorageError> {
        Ok(self.lock()?.devices.values().cloned().collect())
    }

    fn insert_checkin_if_new(&self, checkin: Checkin) -> Result<bool, StorageError> {
        Ok(self.lock()?.insert_checkin_if_new(checkin))
    }

    fn checkins(&self) -> Result<Vec<Checkin>, StorageError> {
        Ok(self.lock()?.checkins.clone())
    }

    fn prune_closed_commands(&self, closed_before: DateTime<Utc>) -> Result<usize, StorageError> {
        Ok(self.lock()?.take_closed_commands(closed_before).len())
    }
}

/// [`BlobStore`] kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<(String, Vendor), EnrollmentBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get_template(
        &self,
        user_id: &str,
        vendor: Vendor,
    ) -> Result<Option<EnrollmentBlob>, StorageError> {
        let blobs = self.blobs.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(blobs.get(&(user_id.to_string(), vendor)).cloned())
    }

    fn put_template(&self, user_id: &str, blob: &EnrollmentBlob) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock().map_err(|_| StorageError::Poisoned)?;
        blobs.insert((user_id.to_string(), blob.vendor), blob.clone());
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use biolink_core::domain::checkin::LogType;
    use biolink_core::CommandKind;
    use std::sync::Arc;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_insert_command_if_absent_returns_existing_pending() {
        // Arrange
        let store = MemoryRecordStore::new();
        let first = Command::new("DEV1", "42", Vendor::Ebkn, CommandKind::EnrollUser, Utc::now());
        let second = Command::new("DEV1", "42", Vendor::Ebkn, CommandKind::EnrollUser, Utc::now());

        // Act
        let a = store.insert_command_if_absent(first.clone()).unwrap();
        let b = store.insert_command_if_absent(second).unwrap();

        // Assert
        assert!(a.is_inserted());
        assert_eq!(b, InsertOutcome::Duplicate(first));
        assert_eq!(store.commands().unwrap().len(), 1);
    }

    #[test]
    fn test_closed_command_does_not_block_new_one() {
        // Arrange
        let store = MemoryRecordStore::new();
        let first = Command::new("DEV1", "42", Vendor::Ebkn, CommandKind::DeleteUser, Utc::now());
        let id = first.id.clone();
        store.insert_command_if_absent(first).unwrap();
        store
            .modify_command(&id, &mut |c| c.status = biolink_core::CommandStatus::Success)
            .unwrap();

        // Act
        let again = Command::new("DEV1", "42", Vendor::Ebkn, CommandKind::DeleteUser, Utc::now());
        let outcome = store.insert_command_if_absent(again).unwrap();

        // Assert
        assert!(outcome.is_inserted());
        assert_eq!(store.commands().unwrap().len(), 2);
    }

    #[test]
    fn test_prune_drops_only_old_closed_commands() {
        // Arrange
        let store = MemoryRecordStore::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for user in ["1", "2", "3"] {
            let cmd = Command::new("DEV1", user, Vendor::Ebkn, CommandKind::DeleteUser, now);
            ids.push(cmd.id.clone());
            store.insert_command_if_absent(cmd).unwrap();
        }
        let close = |id: &str, at| {
            store
                .modify_command(id, &mut |c| {
                    c.status = biolink_core::CommandStatus::Success;
                    c.closed_at = Some(at);
                })
                .unwrap();
        };
        close(&ids[0], now - chrono::Duration::days(5));
        close(&ids[1], now);

        // Act
        let pruned = store.prune_closed_commands(now - chrono::Duration::days(3)).unwrap();

        // Assert
        assert_eq!(pruned, 1);
        let left: Vec<String> = store.commands().unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(left, vec![ids[1].clone(), ids[2].clone()]);
    }

    #[test]
    fn test_upsert_of_identical_record_reports_no_change() {
        let mut set = RecordSet::default();
        let device = Device::new("DEV1", Vendor::Ebkn);

        assert!(set.upsert_device(device.clone()));
        assert!(!set.upsert_device(device));
    }

    #[test]
    fn test_concurrent_inserts_yield_single_pending_command() {
        // Arrange
        let store = Arc::new(MemoryRecordStore::new());

        // Act
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let cmd =
                        Command::new("DEV1", "42", Vendor::Ebkn, CommandKind::EnrollUser, Utc::now());
                    store.insert_command_if_absent(cmd).unwrap().is_inserted()
                })
            })
            .collect();
        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|x| *x)
            .count();

        // Assert
        assert_eq!(inserted, 1);
        assert_eq!(store.pending_commands("DEV1").unwrap().len(), 1);
    }

    #[test]
    fn test_modify_unknown_command_returns_none() {
        let store = MemoryRecordStore::new();

        assert!(store.modify_command("nope", &mut |_| {}).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_checkin_is_not_stored() {
        // Arrange
        let store = MemoryRecordStore::new();
        let punch = Checkin {
            employee: Some("EMP-1".to_string()),
            device_user_id: "42".to_string(),
            time: at("2024-05-01 08:00:00"),
            device_id: "DEV1".to_string(),
            log_type: LogType::In,
        };

        // Act
        let first = store.insert_checkin_if_new(punch.clone()).unwrap();
        let second = store.insert_checkin_if_new(punch).unwrap();

        // Assert
        assert!(first);
        assert!(!second);
        assert_eq!(store.checkins().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_blob_store_keys_by_user_and_vendor() {
        // Arrange
        let blobs = MemoryBlobStore::new();
        blobs
            .put_template("42", &EnrollmentBlob::new(Vendor::Ebkn, vec![1, 2]))
            .unwrap();

        // Act / Assert
        assert_eq!(
            blobs.get_template("42", Vendor::Ebkn).unwrap().unwrap().bytes,
            vec![1, 2]
        );
        assert!(blobs.get_template("42", Vendor::ZkTeco).unwrap().is_none());
        assert!(blobs.get_template("43", Vendor::Ebkn).unwrap().is_none());
    }

    #[test]
    fn test_fixed_clock_advances() {
        let start = Utc::now();
        let clock = FixedClock::new(start);

        clock.advance(chrono::Duration::hours(2));

        assert_eq!(clock.now() - start, chrono::Duration::hours(2));
    }
}
