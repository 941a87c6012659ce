//! Heap error types
//!
//! Argument and exhaustion failures are ordinary return values. Corrupted
//! bookkeeping is not recoverable and goes through [`invariant_violation!`],
//! which logs and aborts.

use thiserror::Error;
use void_pages::PageError;

use crate::config::ConfigError;
use crate::handle::HeapHandle;

/// Errors returned by heap operations
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("Zero-size allocation request")]
    ZeroSize,

    #[error("Invalid alignment {alignment}: must be a power of two and at least {min}")]
    InvalidAlignment { alignment: usize, min: usize },

    #[error("Out of memory: could not serve {requested} bytes")]
    OutOfMemory {
        requested: usize,
        #[source]
        source: Option<PageError>,
    },

    #[error("Invalid heap handle {0:?}")]
    InvalidHandle(HeapHandle),

    #[error("Byte range {offset}..{end} outside allocation of {size} bytes")]
    OutOfBounds { offset: usize, end: usize, size: usize },

    #[error("Global heap already initialized")]
    AlreadyInitialized,

    #[error("Global heap not initialized")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for heap operations
pub type HeapResult<T> = Result<T, HeapError>;

/// Log an internal bookkeeping failure and abort the process.
macro_rules! invariant_violation {
    ($($arg:tt)*) => {{
        log::error!("Heap invariant violated: {}", format_args!($($arg)*));
        std::process::abort()
    }};
}
