//! Error types for ttymux.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TtymuxError {
    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Terminal automation error: {0}")]
    Terminal(String),

    #[error("{program} timed out after {seconds:.1}s")]
    Timeout { program: String, seconds: f64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TtymuxError>;
