// src/error.rs
// Error taxonomy for the consensus/P2P core (spec §7).
//
// Steady-state failures are all recoverable: a bad frame drops the connection,
// a bad block is rejected, a failed BFT round fails cleanly. Only startup
// configuration problems are fatal, and those are anyhow::Error at the binary
// boundary, not part of this enum.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("auth failure: {0}")]
    AuthFailure(String),

    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("invalid block: {0}")]
    BlockInvalid(String),

    #[error("equivocation detected for validator {validator} at height {height}")]
    Equivocation { validator: String, height: u64 },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("transient io error: {0}")]
    TransientIo(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
