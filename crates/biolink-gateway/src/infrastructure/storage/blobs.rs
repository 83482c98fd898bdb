//! Durable [`BlobStore`]: one file per (user, vendor) template.
//!
//! ```text
//! <data_dir>/templates/
//! ├── ebkn/42.bin          raw template bytes, exactly as uploaded
//! └── zk_teco/
//!     ├── 7.bin
//!     └── 7.slot           finger slot, when not 0
//! ```

use std::path::PathBuf;

use biolink_core::{EnrollmentBlob, Vendor};

use super::{read_optional, write_atomic};
use crate::application::store::{BlobStore, StorageError};

const TEMPLATES_DIR: &str = "templates";

pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Keeps templates under `data_dir/templates`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into().join(TEMPLATES_DIR),
        }
    }

    fn paths(&self, user_id: &str, vendor: Vendor) -> Result<(PathBuf, PathBuf), StorageError> {
        let valid = !user_id.is_empty()
            && user_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-'));
        if !valid {
            return Err(StorageError::InvalidKey(user_id.to_string()));
        }
        let dir = self.root.join(vendor.as_str());
        Ok((
            dir.join(format!("{user_id}.bin")),
            dir.join(format!("{user_id}.slot")),
        ))
    }
}

impl BlobStore for FileBlobStore {
    fn get_template(
        &self,
        user_id: &str,
        vendor: Vendor,
    ) -> Result<Option<EnrollmentBlob>, StorageError> {
        let (bin, slot_path) = self.paths(user_id, vendor)?;
        let Some(bytes) = read_optional(&bin).map_err(|source| StorageError::Io {
            path: bin.clone(),
            source,
        })?
        else {
            return Ok(None);
        };

        let slot = match read_optional(&slot_path).map_err(|source| StorageError::Io {
            path: slot_path.clone(),
            source,
        })? {
            None => 0,
            Some(raw) => String::from_utf8_lossy(&raw).trim().parse().map_err(|_| {
                StorageError::Corrupt {
                    path: slot_path.clone(),
                    reason: "slot is not a number".to_string(),
                }
            })?,
        };
        Ok(Some(EnrollmentBlob {
            vendor,
            bytes,
            slot,
        }))
    }

    fn put_template(&self, user_id: &str, blob: &EnrollmentBlob) -> Result<(), StorageError> {
        let (bin, slot_path) = self.paths(user_id, blob.vendor)?;
        write_atomic(&bin, &blob.bytes).map_err(|source| StorageError::Io {
            path: bin.clone(),
            source,
        })?;

        let slot_result = if blob.slot == 0 {
            match std::fs::remove_file(&slot_path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        } else {
            write_atomic(&slot_path, blob.slot.to_string().as_bytes())
        };
        slot_result.map_err(|source| StorageError::Io {
            path: slot_path,
            source,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
