//! PV access server library crate.
//!
//! Exposes configuration, record loading and the socket transports for use
//! by the `caserver` binary and integration tests.
pub mod config;
pub mod records;
pub mod transport;
