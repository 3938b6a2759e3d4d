//! Common types shared across the ttymux crates.
//!
//! Holds the crate-wide error type and the working-directory checks applied
//! before a terminal is opened.

pub mod error;
pub mod security;

pub use error::{Result, TtymuxError};
pub use security::{validate_working_dir, PathSecurityConfig};
