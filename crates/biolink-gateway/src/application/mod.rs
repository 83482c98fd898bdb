//! Application layer use cases for the gateway.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure business rules, here the `biolink-core` crate) and the
//! infrastructure (HTTP server, files on disk, outbound REST calls).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil a device request (e.g., "the
//!   terminal polled for work: pick its oldest pending command, build it and
//!   hand back the bytes").
//! - **Depend on abstractions** (traits such as [`store::RecordStore`]) rather
//!   than concrete implementations, so storage can be swapped without
//!   changing this code.
//! - **Contain no sockets and no file system access** of their own.
//!
//! # Sub-modules
//!
//! - **`store`** – Storage traits the use cases depend on, plus an in-process
//!   record store and the clock abstraction.
//!
//! - **`command_queue`** – The per-device outbound command queue: dedup on
//!   enqueue, oldest-first selection, attempt counting and age-based expiry.
//!
//! - **`outbox`** – Turns "the device is polling" into "this is the wire
//!   payload to send", applying the missing-template policy.
//!
//! - **`checkin`** – Records attendance punches with duplicate detection.
//!
//! - **`enrollment`** – Saves device users and fans the change out to the
//!   command queue via the pure diff/plan functions in `biolink-core`.
//!
//! - **`ebkn`**, **`zkteco`**, **`hikvision`** – One protocol adapter per
//!   vendor.  Each catches every failure at its boundary and answers with a
//!   vendor-appropriate negative acknowledgement.
//!
//! - **`dispatch`** – Maps an inbound method + path to a [`dispatch::Route`].
//!
//! - **`error`** – The gateway-wide error taxonomy and its HTTP mapping.

pub mod checkin;
pub mod command_queue;
pub mod dispatch;
pub mod ebkn;
pub mod enrollment;
pub mod error;
pub mod hikvision;
pub mod outbox;
pub mod store;
pub mod zkteco;
