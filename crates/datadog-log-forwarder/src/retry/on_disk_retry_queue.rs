// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk-resident, quota-bounded stack of transaction collections.
//!
//! Every call to [`OnDiskRetryQueue::serialize`] writes one segment file named
//! after a strictly increasing sequence number (`00000000000000000042.retry`).
//! [`OnDiskRetryQueue::deserialize`] pops the segment with the highest
//! sequence: the freshest failures are replayed first, while the oldest ones
//! are the first to go when the disk quota is exceeded.
//!
//! Sequence numbers and the space accounting are rebuilt from the directory
//! listing when a queue is created, so segments written before a restart are
//! picked up again and new segments never reuse a sequence number.
//!
//! The directory must be owned by a single queue instance. Two queues, in the
//! same or different processes, pointing at the same directory will corrupt
//! each other's accounting.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, warn};

use crate::errors::RetryQueueError;
use crate::retry::disk_usage::DiskUsageLimit;
use crate::retry::serializer::TransactionsSerializer;

const SEGMENT_EXTENSION: &str = "retry";
const TEMP_EXTENSION: &str = "tmp";

/// Counters and gauges describing the queue activity.
#[derive(Debug, Default)]
pub struct RetryQueueTelemetry {
    serialize_count: AtomicU64,
    deserialize_count: AtomicU64,
    deserialize_errors: AtomicU64,
    files_removed: AtomicU64,
    bytes_removed: AtomicU64,
    current_size_in_bytes: AtomicU64,
    files_count: AtomicU64,
}

impl RetryQueueTelemetry {
    #[must_use]
    pub fn serialize_count(&self) -> u64 {
        self.serialize_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn deserialize_count(&self) -> u64 {
        self.deserialize_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn deserialize_errors(&self) -> u64 {
        self.deserialize_errors.load(Ordering::Relaxed)
    }

    /// Segments evicted to stay within the disk quota.
    #[must_use]
    pub fn files_removed(&self) -> u64 {
        self.files_removed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_removed(&self) -> u64 {
        self.bytes_removed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_size_in_bytes(&self) -> u64 {
        self.current_size_in_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn files_count(&self) -> u64 {
        self.files_count.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Segment {
    sequence: u64,
    path: PathBuf,
    size: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    // Ordered by sequence, oldest first.
    segments: VecDeque<Segment>,
    current_size_in_bytes: u64,
    next_sequence: u64,
}

pub struct OnDiskRetryQueue<S: TransactionsSerializer> {
    serializer: S,
    path: PathBuf,
    disk_usage_limit: DiskUsageLimit,
    telemetry: Arc<RetryQueueTelemetry>,
    state: Mutex<QueueState>,
}

impl<S: TransactionsSerializer> OnDiskRetryQueue<S> {
    /// Opens the queue rooted at `path`, creating the directory if needed and
    /// reloading the segments already in it.
    pub fn new(
        serializer: S,
        path: impl Into<PathBuf>,
        disk_usage_limit: DiskUsageLimit,
        telemetry: Arc<RetryQueueTelemetry>,
    ) -> Result<Self, RetryQueueError> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        let state = reload_segments(&path)?;
        if !state.segments.is_empty() {
            debug!(
                "RETRY | Reloaded {} retry files ({} bytes) from {}",
                state.segments.len(),
                state.current_size_in_bytes,
                path.display()
            );
        }

        let queue = Self {
            serializer,
            path,
            disk_usage_limit,
            telemetry,
            state: Mutex::new(state),
        };
        queue.update_gauges(&queue.lock_state());
        Ok(queue)
    }

    /// Persists `transactions` as a new segment, then evicts the oldest
    /// segments until the queue fits in its disk quota again.
    ///
    /// The segment just written is never evicted. When the disk ratio leaves
    /// less room than that one segment, it stays on disk and
    /// [`Self::disk_space_used`] remains above the limit until the next
    /// `deserialize` or a later write evicts it.
    ///
    /// On error nothing was written and the queue is unchanged.
    pub fn serialize(&self, transactions: &[S::Transaction]) -> Result<(), RetryQueueError> {
        let bytes = self.serializer.serialize(transactions)?;
        let size = bytes.len() as u64;

        let maximum = self.disk_usage_limit.max_size_in_bytes();
        if size > maximum {
            return Err(RetryQueueError::PayloadTooBig {
                current: size,
                maximum,
            });
        }

        let mut state = self.lock_state();
        let sequence = state.next_sequence;
        let next_sequence = sequence.checked_add(1).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "retry sequence numbers exhausted")
        })?;
        let path = segment_path(&self.path, sequence);
        write_segment(&path, &bytes)?;

        state.next_sequence = next_sequence;
        state.current_size_in_bytes += size;
        state.segments.push_back(Segment {
            sequence,
            path,
            size,
        });
        self.telemetry.serialize_count.fetch_add(1, Ordering::Relaxed);

        self.evict_oldest(&mut state);
        self.update_gauges(&state);
        Ok(())
    }

    /// Pops the most recently written segment.
    ///
    /// An empty queue yields an empty collection. A segment that cannot be
    /// read or decoded is left in place and the error returned; use
    /// [`Self::drop_newest`] to discard it.
    pub fn deserialize(&self) -> Result<Vec<S::Transaction>, RetryQueueError> {
        let mut state = self.lock_state();
        let Some(segment) = state.segments.back() else {
            return Ok(Vec::new());
        };

        let transactions = fs::read(&segment.path)
            .map_err(RetryQueueError::from)
            .and_then(|bytes| Ok(self.serializer.deserialize(&bytes)?));
        let transactions = match transactions {
            Ok(transactions) => transactions,
            Err(e) => {
                self.telemetry
                    .deserialize_errors
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    "RETRY | Failed to read retry file {}: {e}",
                    segment.path.display()
                );
                return Err(e);
            }
        };

        remove_segment_file(&segment.path)?;
        if let Some(segment) = state.segments.pop_back() {
            state.current_size_in_bytes -= segment.size;
        }
        self.telemetry
            .deserialize_count
            .fetch_add(1, Ordering::Relaxed);
        self.update_gauges(&state);
        Ok(transactions)
    }

    /// Deletes the most recently written segment without decoding it.
    /// Returns whether a segment was dropped.
    pub fn drop_newest(&self) -> Result<bool, RetryQueueError> {
        let mut state = self.lock_state();
        let Some(segment) = state.segments.back() else {
            return Ok(false);
        };
        remove_segment_file(&segment.path)?;
        if let Some(segment) = state.segments.pop_back() {
            warn!(
                "RETRY | Dropped retry file {} ({} bytes)",
                segment.path.display(),
                segment.size
            );
            state.current_size_in_bytes -= segment.size;
        }
        self.update_gauges(&state);
        Ok(true)
    }

    /// Bytes currently used by the segments on disk.
    #[must_use]
    pub fn disk_space_used(&self) -> u64 {
        self.lock_state().current_size_in_bytes
    }

    #[must_use]
    pub fn files_count(&self) -> usize {
        self.lock_state().segments.len()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn telemetry(&self) -> Arc<RetryQueueTelemetry> {
        Arc::clone(&self.telemetry)
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // The segment that was just written is never evicted: it already fits in
    // `max_size_in_bytes`, and dropping it would lose the freshest data.
    fn evict_oldest(&self, state: &mut QueueState) {
        let limit = match self.disk_usage_limit.limit(state.current_size_in_bytes) {
            Ok(limit) => limit,
            Err(e) => {
                warn!("RETRY | Failed to compute the disk usage limit, falling back to max size: {e}");
                self.disk_usage_limit.max_size_in_bytes()
            }
        };

        while state.current_size_in_bytes > limit && state.segments.len() > 1 {
            let Some(oldest) = state.segments.front() else {
                break;
            };
            if let Err(e) = remove_segment_file(&oldest.path) {
                error!(
                    "RETRY | Failed to remove retry file {}: {e}",
                    oldest.path.display()
                );
                break;
            }
            if let Some(oldest) = state.segments.pop_front() {
                debug!(
                    "RETRY | Disk quota exceeded, removed retry file {} ({} bytes)",
                    oldest.path.display(),
                    oldest.size
                );
                state.current_size_in_bytes -= oldest.size;
                self.telemetry.files_removed.fetch_add(1, Ordering::Relaxed);
                self.telemetry
                    .bytes_removed
                    .fetch_add(oldest.size, Ordering::Relaxed);
            }
        }
    }

    fn update_gauges(&self, state: &QueueState) {
        self.telemetry
            .current_size_in_bytes
            .store(state.current_size_in_bytes, Ordering::Relaxed);
        self.telemetry
            .files_count
            .store(state.segments.len() as u64, Ordering::Relaxed);
    }
}

fn segment_path(root: &Path, sequence: u64) -> PathBuf {
    root.join(format!("{sequence:020}.{SEGMENT_EXTENSION}"))
}

fn parse_sequence(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn reload_segments(root: &Path) -> io::Result<QueueState> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();

        if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
            // left behind by an interrupted write, never committed
            if let Err(e) = fs::remove_file(&path) {
                warn!("RETRY | Failed to remove {}: {e}", path.display());
            }
            continue;
        }

        let Some(sequence) = parse_sequence(&path) else {
            continue;
        };
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        segments.push(Segment {
            sequence,
            path,
            size: metadata.len(),
        });
    }
    segments.sort_by_key(|segment| segment.sequence);

    let current_size_in_bytes = segments.iter().map(|segment| segment.size).sum();
    let next_sequence = match segments.last() {
        Some(segment) => segment.sequence.checked_add(1).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "retry file {} exhausts the sequence numbers",
                    segment.path.display()
                ),
            )
        })?,
        None => 0,
    };
    Ok(QueueState {
        segments: segments.into(),
        current_size_in_bytes,
        next_sequence,
    })
}

// Written to a temporary name first so a crash never leaves a truncated
// segment behind under a valid name.
fn write_segment(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension(TEMP_EXTENSION);
    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn remove_segment_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
