//! Domain entities for biolink.
//!
//! This module contains pure business logic with no infrastructure dependencies.
//!
//! # What lives here? (for beginners)
//!
//! The domain layer is the innermost ring of the workspace.  It knows what a
//! *device*, a *device user* and a *command* are, and it owns the rules that
//! govern them: when a command is considered failed, which success code each
//! vendor sends, and which commands a change to a user should produce.  It
//! never touches the network or the filesystem, so every rule here can be
//! unit-tested with plain values.

/// Vendor families and their wire-level success codes.
pub mod vendor;

/// Outbound command entity and its lifecycle rules.
pub mod command;

/// Registered terminals.
pub mod device;

/// Users known to terminals, their memberships and enrollment templates.
pub mod user;

/// Attendance records produced by terminals.
pub mod checkin;

/// Before/after change detection and command planning.
pub mod sync;
