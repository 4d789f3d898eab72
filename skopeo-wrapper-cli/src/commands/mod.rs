//! CLI command handlers.

pub mod common;
pub mod image;
#[cfg(feature = "metrics-server")]
pub mod serve;
