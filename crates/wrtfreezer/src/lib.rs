pub mod build;
pub mod checksum;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod log_sanitize;
pub mod manifest;
pub mod orchestrator;
pub mod prompt;
pub mod remote;
pub mod repositories;
pub mod toolchain;
pub mod workspace;

pub use error::{Error, ErrorKind, Result};
