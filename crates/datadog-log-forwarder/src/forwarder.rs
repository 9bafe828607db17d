// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of encoded payloads, with a disk-backed second chance.
//!
//! ```text
//!   Payload ──> HttpTransaction ──> Transport ──ok──> done
//!                                      │
//!                                    error
//!                                      v
//!                               OnDiskRetryQueue ──(retry tick, newest first)──> Transport
//! ```
//!
//! The forwarder never blocks the pipeline on a failing destination: a
//! transaction that cannot be delivered is persisted right away and only
//! retried on the next retry tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::{RetryQueueError, TransportError};
use crate::logs::message::Payload;
use crate::retry::on_disk_retry_queue::OnDiskRetryQueue;
use crate::retry::serializer::HttpTransactionsSerializer;
use crate::retry::transaction::{Endpoint, HttpTransaction};

pub const API_KEY_HEADER: &str = "DD-API-KEY";

/// Delivers one transaction to its destination.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, transaction: &HttpTransaction) -> Result<(), TransportError>;
}

pub type HttpRetryQueue = OnDiskRetryQueue<HttpTransactionsSerializer>;

#[derive(Debug, Default)]
pub struct ForwarderTelemetry {
    sent: AtomicU64,
    failed: AtomicU64,
    persisted: AtomicU64,
    replayed: AtomicU64,
    dropped: AtomicU64,
    segments_discarded: AtomicU64,
}

impl ForwarderTelemetry {
    /// Transactions delivered, on the first attempt or on replay.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn replayed(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }

    /// Transactions lost because they could not be persisted.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Retry segments deleted because they could not be decoded.
    #[must_use]
    pub fn segments_discarded(&self) -> u64 {
        self.segments_discarded.load(Ordering::Relaxed)
    }
}

pub struct Forwarder {
    transport: Arc<dyn Transport>,
    retry_queue: Option<Arc<HttpRetryQueue>>,
    domain: String,
    endpoint: Endpoint,
    api_key: Option<String>,
    telemetry: Arc<ForwarderTelemetry>,
}

impl Forwarder {
    /// Without a retry queue, failed transactions are dropped.
    pub fn new(
        transport: Arc<dyn Transport>,
        retry_queue: Option<Arc<HttpRetryQueue>>,
        domain: impl Into<String>,
        endpoint: Endpoint,
        api_key: Option<String>,
    ) -> Self {
        Self {
            transport,
            retry_queue,
            domain: domain.into(),
            endpoint,
            api_key,
            telemetry: Arc::new(ForwarderTelemetry::default()),
        }
    }

    #[must_use]
    pub fn telemetry(&self) -> Arc<ForwarderTelemetry> {
        Arc::clone(&self.telemetry)
    }

    /// Forwards payloads until `payload_rx` closes or `cancel` fires, and
    /// replays the retry queue every `retry_interval`. Payloads already
    /// queued when cancelled are still forwarded before returning.
    pub async fn run(
        self,
        mut payload_rx: mpsc::Receiver<Payload>,
        retry_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut retry_ticker = interval_at(Instant::now() + retry_interval, retry_interval);
        retry_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                payload = payload_rx.recv() => match payload {
                    Some(payload) => self.forward(payload).await,
                    None => break,
                },
                _ = retry_ticker.tick() => self.replay().await,
            }
        }

        payload_rx.close();
        while let Some(payload) = payload_rx.recv().await {
            self.forward(payload).await;
        }
        debug!("LOGS | Forwarder stopped");
    }

    fn create_transaction(&self, payload: Payload) -> HttpTransaction {
        let mut transaction =
            HttpTransaction::new(self.domain.clone(), self.endpoint.clone(), payload.encoded)
                .with_header("Content-Type", payload.content_type)
                .with_header("Content-Encoding", payload.encoding);
        if let Some(api_key) = &self.api_key {
            transaction = transaction.with_header(API_KEY_HEADER, api_key.clone());
        }
        transaction
    }

    async fn forward(&self, payload: Payload) {
        let transaction = self.create_transaction(payload);
        match self.transport.send(&transaction).await {
            Ok(()) => {
                self.telemetry.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.telemetry.failed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "LOGS | Failed to send to {}, will retry later: {e}",
                    transaction.url()
                );
                self.persist(vec![transaction]);
            }
        }
    }

    /// Replays segments, newest first, until the queue is empty or a
    /// transaction fails again.
    ///
    /// A segment that does not decode would hide every older segment, so it
    /// is deleted. I/O errors end the tick and the segment is read again on
    /// the next one.
    async fn replay(&self) {
        let Some(retry_queue) = &self.retry_queue else {
            return;
        };

        while retry_queue.files_count() > 0 {
            let transactions = match retry_queue.deserialize() {
                Ok(transactions) => transactions,
                Err(RetryQueueError::Serializer(e)) => {
                    if !self.discard_newest_segment(retry_queue, &e.to_string()) {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    error!("RETRY | Failed to read transactions from the retry queue: {e}");
                    return;
                }
            };
            if transactions.is_empty() {
                continue;
            }

            debug!("RETRY | Replaying {} transactions", transactions.len());
            let mut pending = transactions.into_iter();
            while let Some(mut transaction) = pending.next() {
                if let Err(e) = self.transport.send(&transaction).await {
                    self.telemetry.failed.fetch_add(1, Ordering::Relaxed);
                    debug!("RETRY | Replay failed, destination still unavailable: {e}");
                    transaction.error_count += 1;
                    let mut unsent = vec![transaction];
                    unsent.extend(pending);
                    self.persist(unsent);
                    return;
                }
                self.telemetry.sent.fetch_add(1, Ordering::Relaxed);
                self.telemetry.replayed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn discard_newest_segment(&self, retry_queue: &HttpRetryQueue, reason: &str) -> bool {
        match retry_queue.drop_newest() {
            Ok(_) => {
                self.telemetry
                    .segments_discarded
                    .fetch_add(1, Ordering::Relaxed);
                error!("RETRY | Discarded a retry segment that could not be decoded: {reason}");
                true
            }
            Err(e) => {
                error!("RETRY | Failed to discard an undecodable retry segment: {e}");
                false
            }
        }
    }

    fn persist(&self, transactions: Vec<HttpTransaction>) {
        let count = transactions.len() as u64;
        let Some(retry_queue) = &self.retry_queue else {
            warn!("LOGS | Dropping {count} transactions: retry on disk is disabled");
            self.telemetry.dropped.fetch_add(count, Ordering::Relaxed);
            return;
        };

        match retry_queue.serialize(&transactions) {
            Ok(()) => {
                self.telemetry.persisted.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                error!("RETRY | Dropping {count} transactions, failed to persist them: {e}");
                self.telemetry.dropped.fetch_add(count, Ordering::Relaxed);
            }
        }
    }
}
