//! Host free-memory sampling.

use crate::{Error, Result};
use std::path::PathBuf;

/// Source of host free-memory samples.
pub trait HostMemory: Send + Sync {
    /// Bytes the host can currently spare.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample cannot be taken.
    fn free_bytes(&self) -> Result<u64>;
}

/// Reads `MemAvailable` (or `MemFree` on kernels without it) from
/// `/proc/meminfo`.
#[derive(Debug, Clone)]
pub struct ProcMeminfo {
    path: PathBuf,
}

impl ProcMeminfo {
    /// Sample the running kernel.
    #[must_use]
    pub fn new() -> Self {
        Self::at("/proc/meminfo")
    }

    /// Sample a meminfo-formatted file at `path`.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMeminfo {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMemory for ProcMeminfo {
    fn free_bytes(&self) -> Result<u64> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Io(format!("failed to read {}: {e}", self.path.display())))?;
        parse_meminfo(&content, "MemAvailable")
            .or_else(|_| parse_meminfo(&content, "MemFree"))
    }
}

/// Extract `key` from meminfo content, in bytes.
///
/// # Errors
///
/// Returns [`Error::Io`] if the key is missing or its value is unreadable.
pub fn parse_meminfo(content: &str, key: &str) -> Result<u64> {
    for line in content.lines() {
        let Some(rest) = line.strip_prefix(key) else {
            continue;
        };
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let kb: u64 = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Io(format!("invalid {key} value in meminfo")))?;
        return kb
            .checked_mul(1024)
            .ok_or_else(|| Error::Io(format!("{key} value overflows")));
    }
    Err(Error::Io(format!("{key} not found in meminfo")))
}
