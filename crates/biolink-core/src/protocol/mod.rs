//! Protocol module: block reassembly, the hybrid payload codec and wire framing.

pub mod framing;
pub mod hybrid;
pub mod reassembly;

use thiserror::Error;

pub use framing::{frame_text, unframe, WireBody};
pub use hybrid::{decode_payload, encode_payload, inline_segments, DecodedPayload, Segment};
pub use reassembly::{
    BlockReassembler, MemorySessionStore, Reassembly, ReassemblyError, SessionKey, SessionStore,
    SessionStoreError,
};

/// Errors caused by malformed or out-of-sequence input from a device.
///
/// These are always reported back to the device as an error reply and are
/// never retried by the server: the device's own retry behaviour is relied on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A block arrived that does not directly follow the last accepted block.
    #[error("block sequence mismatch (last accepted block {last:?}, got {got})")]
    BlockSequenceMismatch {
        /// The last block accepted for the session, `None` when no session
        /// exists (only block 1 or block 0 can start one).
        last: Option<u32>,
        got: u32,
    },

    /// The payload does not contain a well-formed JSON envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A length-prefixed frame is truncated or its length field is inconsistent.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}
