// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Concurrent batching of log messages.
//!
//! A [`BatchStrategy`] spawns one task that owns its [`MessageBuffer`]. The
//! task waits on either a new message or the flush ticker:
//!
//! - a message that fills the buffer, or does not fit in it, flushes it;
//! - a message too large for an empty buffer is dropped and counted;
//! - the ticker flushes whatever is pending so nothing waits longer than
//!   `batch_wait`.
//!
//! [`BatchStrategy::stop`] closes the input, drains every queued message,
//! flushes one last time and only returns once the task is gone. Payloads go
//! out in flush order since the task is the only producer on the output
//! channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::constants;
use crate::logs::buffer::MessageBuffer;
use crate::logs::encoding::ContentEncoding;
use crate::logs::message::{Message, Payload};
use crate::logs::serializer::MessageSerializer;

// tokio intervals cannot tick with a zero period
const MIN_BATCH_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct BatchStrategyConfig {
    /// Longest time a message may sit in the buffer.
    pub batch_wait: Duration,
    /// Maximum number of messages in a payload.
    pub max_batch_size: usize,
    /// Maximum aggregate content size of a payload, before encoding.
    pub max_content_size: usize,
    /// Only used to label logs and counters.
    pub pipeline_name: String,
}

impl Default for BatchStrategyConfig {
    fn default() -> Self {
        Self {
            batch_wait: constants::DEFAULT_BATCH_WAIT,
            max_batch_size: constants::MAX_BATCH_SIZE,
            max_content_size: constants::MAX_CONTENT_SIZE_BYTES,
            pipeline_name: "logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyState {
    Created,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Default)]
pub struct BatchStrategyTelemetry {
    dropped_too_large: AtomicU64,
    encoding_failures: AtomicU64,
    payloads_sent: AtomicU64,
    messages_sent: AtomicU64,
}

impl BatchStrategyTelemetry {
    /// Messages dropped because they alone exceed the content size limit.
    #[must_use]
    pub fn dropped_too_large(&self) -> u64 {
        self.dropped_too_large.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn encoding_failures(&self) -> u64 {
        self.encoding_failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn payloads_sent(&self) -> u64 {
        self.payloads_sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }
}

pub struct BatchStrategy {
    // Present until the strategy is started.
    worker: Option<BatchWorker>,
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<StrategyState>>,
    telemetry: Arc<BatchStrategyTelemetry>,
}

impl BatchStrategy {
    #[must_use]
    pub fn new(
        input: mpsc::Receiver<Message>,
        output: mpsc::Sender<Payload>,
        serializer: Arc<dyn MessageSerializer>,
        content_encoding: Arc<dyn ContentEncoding>,
        config: BatchStrategyConfig,
    ) -> Self {
        let (state, _) = watch::channel(StrategyState::Created);
        let state = Arc::new(state);
        let telemetry = Arc::new(BatchStrategyTelemetry::default());

        let worker = BatchWorker {
            input,
            output,
            buffer: MessageBuffer::new(config.max_batch_size, config.max_content_size),
            serializer,
            content_encoding,
            batch_wait: config.batch_wait.max(MIN_BATCH_WAIT),
            pipeline_name: config.pipeline_name,
            telemetry: Arc::clone(&telemetry),
            state: Arc::clone(&state),
        };

        Self {
            worker: Some(worker),
            handle: None,
            cancel: CancellationToken::new(),
            state,
            telemetry,
        }
    }

    /// Spawns the batching task. Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        let Some(worker) = self.worker.take() else {
            warn!("LOGS | Batch strategy already started");
            return;
        };
        self.state.send_replace(StrategyState::Running);
        self.handle = Some(tokio::spawn(worker.run(self.cancel.clone())));
    }

    /// Stops accepting messages, flushes everything already accepted and
    /// waits for the batching task to exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("LOGS | Batch strategy task failed: {e}");
            }
        }
        // Never started: nothing was accepted, so nothing to flush.
        self.worker = None;
        self.state.send_replace(StrategyState::Stopped);
    }

    #[must_use]
    pub fn state(&self) -> StrategyState {
        *self.state.borrow()
    }

    /// Receiver that observes every lifecycle transition.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<StrategyState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn telemetry(&self) -> Arc<BatchStrategyTelemetry> {
        Arc::clone(&self.telemetry)
    }
}

struct BatchWorker {
    input: mpsc::Receiver<Message>,
    output: mpsc::Sender<Payload>,
    buffer: MessageBuffer,
    serializer: Arc<dyn MessageSerializer>,
    content_encoding: Arc<dyn ContentEncoding>,
    batch_wait: Duration,
    pipeline_name: String,
    telemetry: Arc<BatchStrategyTelemetry>,
    state: Arc<watch::Sender<StrategyState>>,
}

impl BatchWorker {
    async fn run(mut self, cancel: CancellationToken) {
        debug!("LOGS | Batch strategy started pipeline={}", self.pipeline_name);

        let mut flush_ticker = interval_at(Instant::now() + self.batch_wait, self.batch_wait);
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_message = self.input.recv() => match maybe_message {
                    Some(message) => self.process_message(message).await,
                    // every producer is gone, no more messages are expected
                    None => break,
                },
                _ = flush_ticker.tick() => {
                    // pending messages must not wait here for too long
                    self.flush_buffer().await;
                }
                () = cancel.cancelled() => {
                    self.state.send_replace(StrategyState::Draining);
                    self.input.close();
                    while let Some(message) = self.input.recv().await {
                        self.process_message(message).await;
                    }
                    break;
                }
            }
        }

        self.state.send_replace(StrategyState::Draining);
        self.flush_buffer().await;
        self.state.send_replace(StrategyState::Stopped);
        debug!("LOGS | Batch strategy stopped pipeline={}", self.pipeline_name);
    }

    async fn process_message(&mut self, message: Message) {
        if let Some(origin) = &message.origin {
            origin.latency_stats.add(message.latency());
        }

        let message = match self.buffer.add_message(message) {
            Ok(()) => {
                if self.buffer.is_full() {
                    self.flush_buffer().await;
                }
                return;
            }
            Err(message) => message,
        };

        // The buffer had no room left, retry once it is empty.
        self.flush_buffer().await;
        match self.buffer.add_message(message) {
            Ok(()) => {
                if self.buffer.is_full() {
                    self.flush_buffer().await;
                }
            }
            Err(message) => {
                warn!(
                    "LOGS | Dropped message in pipeline={} reason=too-large ContentLength={} ContentSizeLimit={}",
                    self.pipeline_name,
                    message.content.len(),
                    self.buffer.content_size_limit()
                );
                self.telemetry
                    .dropped_too_large
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let messages = self.buffer.take_messages();
        self.send_messages(messages).await;
    }

    async fn send_messages(&mut self, messages: Vec<Message>) {
        let serialized = self.serializer.serialize(&messages);
        #[allow(clippy::cast_precision_loss)]
        let avg_msg_size = serialized.len() as f64 / messages.len() as f64;
        debug!(
            "LOGS | Send messages (msg_count:{}, content_size={}, avg_msg_size={:.2})",
            messages.len(),
            serialized.len(),
            avg_msg_size
        );

        let encoded = match self.content_encoding.encode(&serialized) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("LOGS | Encoding failed - dropping payload: {e}");
                self.telemetry
                    .encoding_failures
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let message_count = messages.len() as u64;
        let payload = Payload {
            messages,
            encoded,
            encoding: self.content_encoding.name().to_string(),
            content_type: self.serializer.content_type().to_string(),
            unencoded_size: serialized.len(),
        };

        if self.output.send(payload).await.is_err() {
            error!(
                "LOGS | Failed to send payload in pipeline={} - receiver dropped",
                self.pipeline_name
            );
            return;
        }
        self.telemetry.payloads_sent.fetch_add(1, Ordering::Relaxed);
        self.telemetry
            .messages_sent
            .fetch_add(message_count, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EncodingError;
    use crate::logs::encoding::{IdentityContentEncoding, ZstdContentEncoding};
    use crate::logs::message::LogSource;
    use crate::logs::serializer::LineSerializer;
    use tracing_test::traced_test;

    const NEVER: Duration = Duration::from_secs(3600);

    struct FailingEncoding;

    impl ContentEncoding for FailingEncoding {
        fn name(&self) -> &str {
            "failing"
        }

        fn encode(&self, _payload: &[u8]) -> Result<Vec<u8>, EncodingError> {
            Err(EncodingError::Compression(std::io::Error::other("boom")))
        }
    }

    fn create_strategy(
        batch_wait: Duration,
        max_batch_size: usize,
        max_content_size: usize,
        content_encoding: Arc<dyn ContentEncoding>,
    ) -> (BatchStrategy, mpsc::Sender<Message>, mpsc::Receiver<Payload>) {
        let (input_tx, input_rx) = mpsc::channel(100);
        let (output_tx, output_rx) = mpsc::channel(100);
        let strategy = BatchStrategy::new(
            input_rx,
            output_tx,
            Arc::new(LineSerializer),
            content_encoding,
            BatchStrategyConfig {
                batch_wait,
                max_batch_size,
                max_content_size,
                pipeline_name: "test".to_string(),
            },
        );
        (strategy, input_tx, output_rx)
    }

    fn contents(payload: &Payload) -> Vec<String> {
        payload
            .messages
            .iter()
            .map(|m| String::from_utf8_lossy(&m.content).into_owned())
            .collect()
    }

    async fn collect_payloads(output_rx: &mut mpsc::Receiver<Payload>) -> Vec<Payload> {
        let mut payloads = Vec::new();
        while let Some(payload) = output_rx.recv().await {
            payloads.push(payload);
        }
        payloads
    }

    #[tokio::test]
    async fn test_flushes_when_buffer_is_full() {
        let (mut strategy, input_tx, mut output_rx) =
            create_strategy(NEVER, 2, 1000, Arc::new(IdentityContentEncoding));
        strategy.start();

        for content in ["a", "b", "c"] {
            input_tx.send(Message::new(content)).await.unwrap();
        }

        let first = output_rx.recv().await.unwrap();
        assert_eq!(contents(&first), vec!["a", "b"]);
        assert_eq!(first.encoded, b"a\nb");
        assert_eq!(first.unencoded_size, 3);
        assert_eq!(first.encoding, "identity");
        assert_eq!(first.content_type, "text/plain");

        strategy.stop().await;

        let remaining = collect_payloads(&mut output_rx).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(contents(&remaining[0]), vec!["c"]);
    }

    #[tokio::test]
    async fn test_flushes_when_message_does_not_fit() {
        let (mut strategy, input_tx, mut output_rx) =
            create_strategy(NEVER, 10, 20, Arc::new(IdentityContentEncoding));
        strategy.start();

        input_tx.send(Message::new("x".repeat(15))).await.unwrap();
        input_tx.send(Message::new("y".repeat(15))).await.unwrap();
        strategy.stop().await;

        let payloads = collect_payloads(&mut output_rx).await;
        assert_eq!(payloads.len(), 2);
        assert_eq!(contents(&payloads[0]), vec!["x".repeat(15)]);
        assert_eq!(contents(&payloads[1]), vec!["y".repeat(15)]);
        assert_eq!(strategy.telemetry().dropped_too_large(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_drops_message_too_large() {
        let (mut strategy, input_tx, mut output_rx) =
            create_strategy(NEVER, 10, 10, Arc::new(IdentityContentEncoding));
        strategy.start();

        input_tx.send(Message::new("small")).await.unwrap();
        input_tx.send(Message::new("x".repeat(20))).await.unwrap();
        input_tx.send(Message::new("tiny")).await.unwrap();
        strategy.stop().await;

        let payloads = collect_payloads(&mut output_rx).await;
        let sent: Vec<String> = payloads.iter().flat_map(contents).collect();
        assert_eq!(sent, vec!["small", "tiny"]);
        assert_eq!(strategy.telemetry().dropped_too_large(), 1);
        assert!(logs_contain("reason=too-large"));
        assert!(logs_contain("ContentSizeLimit=10"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_ticker() {
        let batch_wait = Duration::from_millis(100);
        let (mut strategy, input_tx, mut output_rx) =
            create_strategy(batch_wait, 10, 1000, Arc::new(IdentityContentEncoding));
        let start = Instant::now();
        strategy.start();

        input_tx.send(Message::new("a")).await.unwrap();

        let payload = output_rx.recv().await.unwrap();
        assert_eq!(contents(&payload), vec!["a"]);
        assert!(start.elapsed() >= batch_wait);
        assert_eq!(strategy.state(), StrategyState::Running);

        strategy.stop().await;
        assert!(output_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_ticker_flush_is_noop() {
        let (mut strategy, _input_tx, mut output_rx) = create_strategy(
            Duration::from_millis(10),
            10,
            1000,
            Arc::new(IdentityContentEncoding),
        );
        strategy.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(output_rx.try_recv().is_err());

        strategy.stop().await;
        assert!(output_rx.recv().await.is_none());
        assert_eq!(strategy.telemetry().payloads_sent(), 0);
    }

    #[tokio::test]
    async fn test_stop_drains_all_accepted_messages_in_order() {
        let (mut strategy, input_tx, mut output_rx) =
            create_strategy(NEVER, 3, 1000, Arc::new(IdentityContentEncoding));
        strategy.start();

        for i in 0..10 {
            input_tx.send(Message::new(format!("m{i}"))).await.unwrap();
        }
        strategy.stop().await;
        assert_eq!(strategy.state(), StrategyState::Stopped);

        let payloads = collect_payloads(&mut output_rx).await;
        let sent: Vec<String> = payloads.iter().flat_map(contents).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(sent, expected);
        assert!(payloads.iter().all(|p| p.messages.len() <= 3));
        assert_eq!(strategy.telemetry().messages_sent(), 10);

        // input is closed once stopped
        assert!(input_tx.send(Message::new("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_input_closed_by_producers_drains() {
        let (mut strategy, input_tx, mut output_rx) =
            create_strategy(NEVER, 10, 1000, Arc::new(IdentityContentEncoding));
        let mut state = strategy.subscribe_state();
        strategy.start();

        input_tx.send(Message::new("last words")).await.unwrap();
        drop(input_tx);

        state
            .wait_for(|s| *s == StrategyState::Stopped)
            .await
            .unwrap();
        let payload = output_rx.recv().await.unwrap();
        assert_eq!(contents(&payload), vec!["last words"]);

        strategy.stop().await;
        assert_eq!(strategy.state(), StrategyState::Stopped);
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let (mut strategy, _input_tx, _output_rx) =
            create_strategy(NEVER, 10, 1000, Arc::new(IdentityContentEncoding));
        assert_eq!(strategy.state(), StrategyState::Created);

        strategy.start();
        assert_eq!(strategy.state(), StrategyState::Running);

        // a second start is ignored
        strategy.start();
        assert_eq!(strategy.state(), StrategyState::Running);

        strategy.stop().await;
        assert_eq!(strategy.state(), StrategyState::Stopped);

        // stop is idempotent
        strategy.stop().await;
        assert_eq!(strategy.state(), StrategyState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let (mut strategy, _input_tx, mut output_rx) =
            create_strategy(NEVER, 10, 1000, Arc::new(IdentityContentEncoding));

        strategy.stop().await;

        assert_eq!(strategy.state(), StrategyState::Stopped);
        assert!(output_rx.recv().await.is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_encoding_failure_drops_payload() {
        let (mut strategy, input_tx, mut output_rx) =
            create_strategy(NEVER, 10, 1000, Arc::new(FailingEncoding));
        strategy.start();

        input_tx.send(Message::new("lost")).await.unwrap();
        strategy.stop().await;

        assert!(output_rx.recv().await.is_none());
        assert_eq!(strategy.telemetry().encoding_failures(), 1);
        assert!(logs_contain("Encoding failed - dropping payload"));
    }

    #[tokio::test]
    async fn test_zstd_payload() {
        let (mut strategy, input_tx, mut output_rx) =
            create_strategy(NEVER, 10, 1000, Arc::new(ZstdContentEncoding::new(3)));
        strategy.start();

        input_tx.send(Message::new("one")).await.unwrap();
        input_tx.send(Message::new("two")).await.unwrap();
        strategy.stop().await;

        let payload = output_rx.recv().await.unwrap();
        assert_eq!(payload.encoding, "zstd");
        assert_eq!(payload.unencoded_size, 7);
        let decoded = zstd::decode_all(payload.encoded.as_slice()).unwrap();
        assert_eq!(decoded, b"one\ntwo");
    }

    #[tokio::test]
    async fn test_records_latency_on_origin() {
        let (mut strategy, input_tx, _output_rx) =
            create_strategy(NEVER, 10, 1000, Arc::new(IdentityContentEncoding));
        let source = Arc::new(LogSource::new("file:/var/log/app.log"));
        strategy.start();

        input_tx
            .send(Message::new("a").with_origin(Arc::clone(&source)))
            .await
            .unwrap();
        input_tx
            .send(Message::new("b").with_origin(Arc::clone(&source)))
            .await
            .unwrap();
        input_tx.send(Message::new("no origin")).await.unwrap();
        strategy.stop().await;

        assert_eq!(source.latency_stats.count(), 2);
    }
}
