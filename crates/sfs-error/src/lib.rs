#![forbid(unsafe_code)]
//! Error types for SalvageFS.
//!
//! Defines `SfsError` and a `Result<T>` alias used throughout the workspace,
//! plus the process exit-code mapping for the CLI.

use sfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all SalvageFS operations.
#[derive(Debug, Error)]
pub enum SfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("corrupt metadata at bytenr {bytenr}: {detail}")]
    Corruption { bytenr: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unsupported feature: {0}")]
    Unsupported(String),

    #[error("all {mirrors} mirror copies failed for bytenr {bytenr}")]
    MirrorsExhausted { bytenr: u64, mirrors: usize },

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("no space left in tree block")]
    NoSpace,

    #[error("repair failed: {0}")]
    RepairFailed(String),

    #[error("operation aborted")]
    Aborted,
}

impl SfsError {
    /// Convenience constructor for corruption findings.
    #[must_use]
    pub fn corrupt(bytenr: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            bytenr,
            detail: detail.into(),
        }
    }

    /// Process exit code for the CLI: open/IO/format failures are fatal (2),
    /// everything else reaching the top level means the run itself broke.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;
