//! CLI command implementations.

pub mod device;
pub mod hub;
