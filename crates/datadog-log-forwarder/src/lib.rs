// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reliable log forwarding for the Datadog agent.
//!
//! Two halves make up the pipeline:
//!
//! ```text
//!   producers ──Message──> BatchStrategy ──Payload──> Forwarder ──> Transport
//!                                                        │   ^
//!                                          failed sends  v   │ replay (newest first)
//!                                                  OnDiskRetryQueue
//! ```
//!
//! - [`logs`] accumulates messages into size and count bounded payloads on a
//!   single background task.
//! - [`retry`] persists failed transactions to a quota-bounded directory and
//!   replays them most-recent-first.
//! - [`forwarder`] glues the two together around a pluggable [`forwarder::Transport`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod errors;
pub mod forwarder;
pub mod logger;
pub mod logs;
pub mod retry;
