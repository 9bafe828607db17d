// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk quota of the retry queue.
//!
//! The queue may use at most `max_size_in_bytes`, and never so much that the
//! filesystem holding it goes above `max_disk_ratio` of its total capacity.
//! Available space is queried again on every call since other processes
//! keep writing to the same disk.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Space on the filesystem holding a path, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub available: u64,
    pub total: u64,
}

/// Source of filesystem statistics, replaceable for tests.
pub trait DiskUsageRetriever: Send + Sync {
    fn usage(&self, path: &Path) -> io::Result<DiskUsage>;
}

/// Reads filesystem statistics with `statfs(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatfsDiskUsageRetriever;

#[cfg(unix)]
impl DiskUsageRetriever for StatfsDiskUsageRetriever {
    #[allow(clippy::useless_conversion)]
    fn usage(&self, path: &Path) -> io::Result<DiskUsage> {
        let stat = nix::sys::statfs::statfs(path).map_err(io::Error::from)?;
        let block_size = u64::try_from(stat.block_size()).unwrap_or_default();
        Ok(DiskUsage {
            available: block_size.saturating_mul(u64::from(stat.blocks_available())),
            total: block_size.saturating_mul(u64::from(stat.blocks())),
        })
    }
}

#[cfg(not(unix))]
impl DiskUsageRetriever for StatfsDiskUsageRetriever {
    fn usage(&self, _path: &Path) -> io::Result<DiskUsage> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Cannot get disk usage on this platform",
        ))
    }
}

#[derive(Clone)]
pub struct DiskUsageLimit {
    path: PathBuf,
    retriever: Arc<dyn DiskUsageRetriever>,
    max_size_in_bytes: u64,
    max_disk_ratio: f64,
}

impl DiskUsageLimit {
    /// `max_disk_ratio` is clamped to `[0, 1]`.
    pub fn new(
        path: impl Into<PathBuf>,
        retriever: Arc<dyn DiskUsageRetriever>,
        max_size_in_bytes: u64,
        max_disk_ratio: f64,
    ) -> Self {
        Self {
            path: path.into(),
            retriever,
            max_size_in_bytes,
            max_disk_ratio: max_disk_ratio.clamp(0.0, 1.0),
        }
    }

    #[must_use]
    pub fn max_size_in_bytes(&self) -> u64 {
        self.max_size_in_bytes
    }

    /// Bytes the queue may occupy given that it already holds `current_usage`.
    ///
    /// `min(max_size_in_bytes, current_usage + available - reserved)` where
    /// `reserved` is the share of the disk that must stay free.
    pub fn limit(&self, current_usage: u64) -> io::Result<u64> {
        let usage = self.retriever.usage(&self.path)?;
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let reserved = (usage.total as f64 * (1.0 - self.max_disk_ratio)).ceil() as u64;
        let available_to_queue = current_usage
            .saturating_add(usage.available)
            .saturating_sub(reserved);
        Ok(available_to_queue.min(self.max_size_in_bytes))
    }

    /// Whether `requested` more bytes fit on top of `current_usage`.
    pub fn check_only(&self, requested: u64, current_usage: u64) -> io::Result<bool> {
        Ok(current_usage.saturating_add(requested) <= self.limit(current_usage)?)
    }
}

impl std::fmt::Debug for DiskUsageLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskUsageLimit")
            .field("path", &self.path)
            .field("max_size_in_bytes", &self.max_size_in_bytes)
            .field("max_disk_ratio", &self.max_disk_ratio)
            .finish_non_exhaustive()
    }
}
