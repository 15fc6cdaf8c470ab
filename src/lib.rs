//! Per-tenant chat-bot worker.
//!
//! The binary in `main.rs` wires these modules to stdin/stdout; the
//! library target exists so the integration tests can drive a [`worker::Worker`]
//! directly with a fake platform.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod control;
pub mod dedup;
pub mod error;
pub mod logs;
pub mod metrics;
pub mod platform;
pub mod reload;
pub mod utils;
pub mod worker;
