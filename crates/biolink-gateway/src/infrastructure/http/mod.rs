//! HTTP adapters.
//!
//! # Responsibilities
//!
//! - `server`: the device-facing listener, the composition root that wires
//!   stores into use cases, and the housekeeping timer.
//! - `hikvision_client`: the outbound REST client for terminals the gateway
//!   polls instead of being called by.

pub mod hikvision_client;
pub mod server;

pub use server::{router, run_server, serve, AppState};
