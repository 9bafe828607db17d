// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

/// Invalid forwarder configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A content encoding could not produce a payload.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("Failed to compress payload: {0}")]
    Compression(#[from] io::Error),
}

/// A transaction collection could not be turned into bytes or back.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("The domain of the transaction {transaction} does not match the domain {expected}")]
    DomainMismatch {
        transaction: String,
        expected: String,
    },

    #[error("Unsupported transaction format version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid API key placeholder index {0}")]
    UnknownApiKeyIndex(usize),

    #[error("Malformed transactions: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Failures surfaced by the on-disk retry queue.
#[derive(Debug, thiserror::Error)]
pub enum RetryQueueError {
    #[error("The payload is too big. Current: {current} Maximum: {maximum}")]
    PayloadTooBig { current: u64, maximum: u64 },

    #[error("Retry segment I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serializer(#[from] SerializerError),
}

/// A transport could not deliver a transaction.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Destination unavailable: {0}")]
    Destination(String),

    #[error("Request rejected with status {0}")]
    Rejected(u16),
}
