//! Infrastructure layer for the gateway.
//!
//! Contains the outward-facing adapters: the HTTP listener devices talk to,
//! file-backed durable stores, the TOML configuration file and the outbound
//! REST client for server-polled terminals.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `biolink_core`, but MUST NOT be imported by the `application` or domain
//! layers.

pub mod http;
pub mod storage;

pub use http::run_server;
