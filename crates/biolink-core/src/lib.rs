//! # biolink-core
//!
//! Shared library for biolink containing the device protocol engine:
//! block reassembly, the hybrid JSON + binary payload codec, wire framing,
//! the command lifecycle rules and the per-vendor command builders.
//!
//! It has zero dependencies on sockets, files or an async runtime.  Anything
//! that needs durable state (reassembly sessions, command records, templates)
//! is reached through a trait so the gateway crate can plug in real storage.
//!
//! # Architecture overview (for beginners)
//!
//! biolink lets physical fingerprint / face terminals from different vendors
//! talk to one central directory over HTTP.  Each vendor speaks its own
//! dialect, so this crate is the shared foundation that understands all of
//! them.  It defines:
//!
//! - **`protocol`** – How bytes arrive from the binary vendor.  Uploads may be
//!   split into numbered blocks ([`protocol::reassembly`]); once joined, the
//!   payload is a JSON envelope followed by raw binary segments
//!   ([`protocol::hybrid`]).  Replies are wrapped in a small length-prefixed
//!   frame ([`protocol::framing`]).
//!
//! - **`domain`** – Pure business types: vendors, devices, device users,
//!   commands and their lifecycle, check-ins, and the before/after diff that
//!   decides which commands a user change should produce.
//!
//! - **`builders`** – Pure functions that turn a queued command plus a user
//!   record into the exact bytes / text / JSON the target vendor expects.

pub mod builders;
pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `biolink_core::Command` instead of `biolink_core::domain::command::Command`.
pub use builders::{build_command, BuildError, WireCommand};
pub use domain::command::{Command, CommandKind, CommandPolicy, CommandStatus};
pub use domain::device::Device;
pub use domain::user::{DeviceMembership, DeviceUser, EnrollmentBlob};
pub use domain::vendor::Vendor;
pub use protocol::hybrid::{decode_payload, inline_segments, DecodedPayload};
pub use protocol::reassembly::{BlockReassembler, Reassembly, SessionKey, SessionStore};
pub use protocol::ProtocolError;
