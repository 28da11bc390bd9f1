//! Broker service library crate.
//!
//! Exposes the service configuration and the TCP front end so the binary and
//! the integration tests share them.
pub mod config;
pub mod server;
