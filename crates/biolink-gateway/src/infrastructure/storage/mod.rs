//! Storage infrastructure: configuration and durable state on disk.
//!
//! | Sub-module | What it persists                        | Location under `data_dir`                 |
//! |------------|-----------------------------------------|-------------------------------------------|
//! | `config`   | gateway settings                        | (separate `--config` file)                |
//! | `sessions` | in-flight block reassembly sessions     | `partial_data/`, `block_sequence_map.json`|
//! | `records`  | commands, device users, devices         | `records.json`, `commands_archive.jsonl`  |
//! |            | punches, one file per day               | `checkins/<YYYY-MM-DD>.jsonl`             |
//! | `blobs`    | enrollment templates                    | `templates/<vendor>/<user>.bin`           |
//!
//! Whole documents are written through a temp file and rename, so a crash
//! mid-write never leaves a half-written file behind.  Line files only grow
//! by appending one record per line; readers skip a torn last line.
//!
//! The session and record stores also take an advisory lock on a file in
//! `data_dir` (`with_file_lock`) around every read-check-write, so two
//! gateway processes sharing one data directory never interleave.

pub mod blobs;
pub mod config;
pub mod records;
pub mod sessions;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use uuid::Uuid;

/// Runs `f` while holding an exclusive advisory lock on `lock_path`.  The
/// lock file is created (with its directory) if missing and never removed.
/// `io_err` turns a failure to take the lock into the caller's error type.
pub(crate) fn with_file_lock<T, E>(
    lock_path: &Path,
    io_err: impl Fn(io::Error) -> E,
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    let mut lock = open_lock_file(lock_path)
        .map(fd_lock::RwLock::new)
        .map_err(&io_err)?;
    let _held = lock.write().map_err(&io_err)?;
    f()
}

fn open_lock_file(lock_path: &Path) -> io::Result<File> {
    if let Some(dir) = lock_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
}

/// Appends `line` plus a newline to `path` in a single write.  A torn line
/// left by an earlier crash is closed off first so the new record starts on
/// its own line.
pub(crate) fn append_line(path: &Path, line: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;
    let mut record = Vec::with_capacity(line.len() + 2);
    if !ends_with_newline(&mut file)? {
        record.push(b'\n');
    }
    record.extend_from_slice(line);
    record.push(b'\n');
    file.write_all(&record)
}

/// `true` for an empty file too.
fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    use std::io::{Seek, SeekFrom};

    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Writes `bytes` to `path` via a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        e
    })
}

/// Reads `path`, mapping "not found" to `None`.
pub(crate) fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
