// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable retry of failed transactions.
//!
//! Transactions that could not be delivered are serialized into segment
//! files by an [`on_disk_retry_queue::OnDiskRetryQueue`]. The directory is
//! bounded by a [`disk_usage::DiskUsageLimit`]: when it runs out of room the
//! oldest segments are evicted first, and replay always starts from the most
//! recent segment.

pub mod disk_usage;
pub mod on_disk_retry_queue;
pub mod serializer;
pub mod transaction;
