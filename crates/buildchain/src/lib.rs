pub mod config;
pub mod dockerfile;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod fsutil;
pub mod log_sanitize;
pub mod modules;
pub mod planner;
pub mod rpm;
pub mod targets;
pub mod version;
pub mod workspace;

pub use error::{Error, ErrorKind, Result};
