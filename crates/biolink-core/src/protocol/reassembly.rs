//! Block reassembly for chunked binary uploads.
//!
//! # What is a block? (for beginners)
//!
//! The binary vendor's firmware cannot send an arbitrarily large upload in a
//! single HTTP request.  Instead it splits the upload into *blocks* and sends
//! each one as its own POST, numbered in a `blk_no` header:
//!
//! ```text
//! blk_no = 1   first block  (starts a new session, wiping any old one)
//! blk_no = 2   middle block (must directly follow the previous block)
//! ...
//! blk_no = 0   final block  (or the only block of a single-shot upload)
//! ```
//!
//! The server glues the blocks back together into one logical message.  The
//! half-built message lives in a [`SessionStore`] keyed by
//! `(device id, request type)` so that two blocks of the same upload can be
//! handled by different worker processes.
//!
//! # Atomicity
//!
//! Every [`SessionStore`] operation is a single check-and-set step.  A store
//! must never let two workers both observe "last block = 3" and both append
//! block 4.
//!
//! # No expiry
//!
//! A device that stops mid-upload leaves its session behind until a fresh
//! block 1 arrives for the same key.  Sessions are never timed out.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info_span, warn, Span};

use crate::protocol::ProtocolError;

// ── Keys and errors ───────────────────────────────────────────────────────────

/// Identity of one reassembly session.  The key *is* the session: at most one
/// session exists per key at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub device_id: String,
    pub request_type: String,
}

impl SessionKey {
    pub fn new(device_id: impl Into<String>, request_type: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            request_type: request_type.into(),
        }
    }

    /// Flat name used by file-backed stores (`<device>_<request type>`).
    pub fn storage_name(&self) -> String {
        format!("{}_{}", self.device_id, self.request_type)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.request_type)
    }
}

/// The durable session store could not be read or written.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("session store failure: {0}")]
pub struct SessionStoreError(pub String);

/// Result of [`SessionStore::append_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The block directly followed the last one and was appended.
    Appended,
    /// The block was out of sequence; nothing was written.
    Mismatch { last: Option<u32> },
}

/// Errors returned by [`BlockReassembler::accept`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Storage(#[from] SessionStoreError),
}

// ── Store abstraction ─────────────────────────────────────────────────────────

/// Durable storage for in-flight reassembly sessions.
///
/// Implementations must make each method atomic with respect to every other
/// call for the same [`SessionKey`], across threads and (for durable stores)
/// across worker processes sharing the same storage.
pub trait SessionStore: Send + Sync {
    /// Discards any existing session for `key` and starts a new one whose
    /// buffer is `chunk` and whose last accepted block is 1.
    fn restart(&self, key: &SessionKey, chunk: &[u8]) -> Result<(), SessionStoreError>;

    /// Appends `chunk` if and only if a session exists and `block` equals its
    /// last accepted block + 1.  On mismatch nothing is modified.
    fn append_next(
        &self,
        key: &SessionKey,
        block: u32,
        chunk: &[u8],
    ) -> Result<AppendOutcome, SessionStoreError>;

    /// If a session exists: appends `chunk`, deletes the session and returns
    /// the complete buffer.  Returns `None` (and writes nothing) otherwise.
    fn complete(&self, key: &SessionKey, chunk: &[u8])
        -> Result<Option<Vec<u8>>, SessionStoreError>;

    /// Last accepted block of the session, `None` when no session exists.
    fn last_block(&self, key: &SessionKey) -> Result<Option<u32>, SessionStoreError>;
}

/// In-process [`SessionStore`].  Correct for a single worker process; state is
/// lost on restart.  Durable deployments use the gateway's file-backed store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionKey, SessionState>>,
}

struct SessionState {
    buffer: Vec<u8>,
    last_block: u32,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<SessionKey, SessionState>>, SessionStoreError>
    {
        self.sessions
            .lock()
            .map_err(|_| SessionStoreError("session map lock poisoned".to_string()))
    }
}

impl SessionStore for MemorySessionStore {
    fn restart(&self, key: &SessionKey, chunk: &[u8]) -> Result<(), SessionStoreError> {
        self.lock()?.insert(
            key.clone(),
            SessionState {
                buffer: chunk.to_vec(),
                last_block: 1,
            },
        );
        Ok(())
    }

    fn append_next(
        &self,
        key: &SessionKey,
        block: u32,
        chunk: &[u8],
    ) -> Result<AppendOutcome, SessionStoreError> {
        let mut sessions = self.lock()?;
        match sessions.get_mut(key) {
            Some(state) if state.last_block.checked_add(1) == Some(block) => {
                state.buffer.extend_from_slice(chunk);
                state.last_block = block;
                Ok(AppendOutcome::Appended)
            }
            Some(state) => Ok(AppendOutcome::Mismatch {
                last: Some(state.last_block),
            }),
            None => Ok(AppendOutcome::Mismatch { last: None }),
        }
    }

    fn complete(
        &self,
        key: &SessionKey,
        chunk: &[u8],
    ) -> Result<Option<Vec<u8>>, SessionStoreError> {
        Ok(self.lock()?.remove(key).map(|mut state| {
            state.buffer.extend_from_slice(chunk);
            state.buffer
        }))
    }

    fn last_block(&self, key: &SessionKey) -> Result<Option<u32>, SessionStoreError> {
        Ok(self.lock()?.get(key).map(|s| s.last_block))
    }
}

// ── Reassembler ───────────────────────────────────────────────────────────────

/// Outcome of accepting one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// The block was stored; more blocks are expected.
    Continue { block: u32 },
    /// The upload is complete.  Holds the exact concatenation of every block.
    Complete(Vec<u8>),
}

/// Reassembles block-split uploads into single logical messages.
///
/// Holds no session state of its own; everything lives in the injected
/// [`SessionStore`], so one reassembler can be shared by every request task.
pub struct BlockReassembler {
    store: Arc<dyn SessionStore>,
    span: Span,
}

impl BlockReassembler {
    /// Creates a reassembler that logs under a child of `parent`.
    pub fn new(store: Arc<dyn SessionStore>, parent: &Span) -> Self {
        Self {
            store,
            span: info_span!(parent: parent, "reassembler"),
        }
    }

    /// Accepts block `block_number` of the upload identified by
    /// `(device_id, request_type)`.
    ///
    /// - `1` restarts the session with `chunk` and returns `Continue`.
    /// - `n > 1` appends when `n == last + 1`, otherwise fails with
    ///   [`ProtocolError::BlockSequenceMismatch`] and leaves the session untouched.
    /// - `0` finishes: with no session `chunk` is the whole message, otherwise
    ///   the accumulated buffer plus `chunk` is returned and the session deleted.
    ///
    /// # Errors
    ///
    /// [`ReassemblyError::Protocol`] for sequence errors,
    /// [`ReassemblyError::Storage`] when the session store fails.
    pub fn accept(
        &self,
        device_id: &str,
        request_type: &str,
        block_number: u32,
        chunk: &[u8],
    ) -> Result<Reassembly, ReassemblyError> {
        let _guard = self.span.enter();
        let key = SessionKey::new(device_id, request_type);

        match block_number {
            0 => {
                let payload = match self.store.complete(&key, chunk)? {
                    Some(full) => {
                        debug!(%key, len = full.len(), "final block joined session");
                        full
                    }
                    None => {
                        debug!(%key, len = chunk.len(), "single-shot message");
                        chunk.to_vec()
                    }
                };
                Ok(Reassembly::Complete(payload))
            }
            1 => {
                self.store.restart(&key, chunk)?;
                debug!(%key, block = 1, len = chunk.len(), "session started");
                Ok(Reassembly::Continue { block: 1 })
            }
            n => match self.store.append_next(&key, n, chunk)? {
                AppendOutcome::Appended => {
                    debug!(%key, block = n, len = chunk.len(), "block appended");
                    Ok(Reassembly::Continue { block: n })
                }
                AppendOutcome::Mismatch { last } => {
                    warn!(%key, block = n, ?last, "block sequence mismatch");
                    Err(ProtocolError::BlockSequenceMismatch { last, got: n }.into())
                }
            },
        }
    }

    /// Last accepted block for a session, for diagnostics and tests.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError`] when the store cannot be read.
    pub fn last_block(
        &self,
        device_id: &str,
        request_type: &str,
    ) -> Result<Option<u32>, SessionStoreError> {
        self.store
            .last_block(&SessionKey::new(device_id, request_type))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
