//! Heap configuration
//!
//! Loaded from TOML or built in code:
//!
//! ```toml
//! chunk_size = 65536
//! defrag_threshold = 1000
//! compaction = "relocate"   # or "disabled"
//! poison_on_free = true
//! bounded_free_lists = true
//! catch_all_free_limit = 1
//! report_leaks_on_drop = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors from configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// What [`crate::Heap::defragment`] is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionMode {
    /// Slide live blocks together and repoint their handles
    Relocate,
    /// Leave every block where it is
    Disabled,
}

/// Heap tuning knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Minimum bytes requested from the page source per chunk
    pub chunk_size: usize,
    /// Allocations between automatic defragmentations (0 = never)
    pub defrag_threshold: usize,
    /// Compaction strategy
    pub compaction: CompactionMode,
    /// Zero payload bytes on deallocation
    pub poison_on_free: bool,
    /// Cap each free list at its bucket's blocks-per-chunk
    pub bounded_free_lists: bool,
    /// Free blocks the catch-all list keeps before orphaning the rest
    pub catch_all_free_limit: usize,
    /// Emit the leak report when the heap is torn down
    pub report_leaks_on_drop: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            defrag_threshold: 1000,
            compaction: CompactionMode::Relocate,
            poison_on_free: true,
            bounded_free_lists: true,
            catch_all_free_limit: 1,
            report_leaks_on_drop: true,
        }
    }
}

impl HeapConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        let config: HeapConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Validation("chunk_size must be non-zero".into()));
        }
        if self.catch_all_free_limit == 0 {
            return Err(ConfigError::Validation(
                "catch_all_free_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_defrag_threshold(mut self, allocations: usize) -> Self {
        self.defrag_threshold = allocations;
        self
    }

    pub fn with_compaction(mut self, mode: CompactionMode) -> Self {
        self.compaction = mode;
        self
    }

    pub fn with_catch_all_free_limit(mut self, blocks: usize) -> Self {
        self.catch_all_free_limit = blocks;
        self
    }
}
