// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Defaults for the logs pipeline and the forwarder storage.

use std::time::Duration;

/// Maximum uncompressed content size of a single payload (5MB).
pub const MAX_CONTENT_SIZE_BYTES: usize = 5 * 1_024 * 1_024;

/// Maximum number of messages in a single payload.
pub const MAX_BATCH_SIZE: usize = 1000;

/// How long a message may wait in the buffer before a periodic flush.
pub const DEFAULT_BATCH_WAIT: Duration = Duration::from_secs(5);

pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

pub const DEFAULT_STORAGE_PATH: &str = "/tmp/datadog-agent/retry";

/// A quota of zero disables the on-disk retry queue.
pub const DEFAULT_STORAGE_MAX_SIZE_IN_BYTES: u64 = 0;

/// Fraction of the disk that may be in use, by anything, before the retry
/// queue stops growing.
pub const DEFAULT_STORAGE_MAX_DISK_RATIO: f64 = 0.80;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the channels between pipeline stages.
pub const CHANNEL_CAPACITY: usize = 100;

pub const LOGS_INTAKE_ROUTE: &str = "/api/v2/logs";

pub const LOGS_ENDPOINT_NAME: &str = "logs";
