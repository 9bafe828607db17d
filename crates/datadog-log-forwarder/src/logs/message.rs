// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latency between a message entering the pipeline and reaching the batcher.
#[derive(Debug, Default)]
pub struct LatencyStats {
    count: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

impl LatencyStats {
    pub fn add(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed))
    }

    /// Mean latency, zero when nothing was recorded.
    #[must_use]
    pub fn average(&self) -> Duration {
        let count = self.count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed) / count)
    }
}

/// Where a message was collected from (a file, a container, a socket...).
#[derive(Debug, Default)]
pub struct LogSource {
    pub name: String,
    pub latency_stats: LatencyStats,
}

impl LogSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency_stats: LatencyStats::default(),
        }
    }
}

/// One unit of raw log content entering the pipeline.
#[derive(Clone)]
pub struct Message {
    pub content: Vec<u8>,
    pub origin: Option<Arc<LogSource>>,
    pub ingestion_timestamp: Instant,
}

impl Message {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            origin: None,
            ingestion_timestamp: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: Arc<LogSource>) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Time spent since the message was created.
    #[must_use]
    pub fn latency(&self) -> Duration {
        self.ingestion_timestamp.elapsed()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("content", &String::from_utf8_lossy(&self.content))
            .field("origin", &self.origin.as_ref().map(|o| o.name.as_str()))
            .finish()
    }
}

/// An encoded batch of messages, ready to be sent.
#[derive(Debug, Clone)]
pub struct Payload {
    /// The messages that went into this payload, in arrival order.
    pub messages: Vec<Message>,
    pub encoded: Vec<u8>,
    /// Name of the content encoding, e.g. `zstd`.
    pub encoding: String,
    /// MIME type of the body before encoding.
    pub content_type: String,
    pub unencoded_size: usize,
}
