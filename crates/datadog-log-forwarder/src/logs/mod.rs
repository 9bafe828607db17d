// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory batching of log messages into encoded payloads.
//!
//! ```text
//!   Message ──> MessageBuffer ──flush──> MessageSerializer ──> ContentEncoding ──> Payload
//!               (count + size bound)      (lines / JSON array)   (identity / zstd)
//! ```
//!
//! A [`batch_strategy::BatchStrategy`] owns the buffer on a single task and
//! flushes it when it fills up, when the flush ticker fires, or when the
//! strategy is stopped.

pub mod batch_strategy;
pub mod buffer;
pub mod encoding;
pub mod message;
pub mod serializer;
