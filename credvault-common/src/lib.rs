//! Common utilities shared across the CredVault crates.

pub mod logging;

pub use logging::{init_logging, Component, Logger};
