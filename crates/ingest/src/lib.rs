// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reliability and flow-control core for shipping tagged entries to remote collectors.
//!
//! Producers hand [`entry::Entry`] values to a [`coordinator::Coordinator`], which
//! resolves tags through the [`tags::Tagger`], writes to the first hot connection
//! through a shared [`rate_limiter::RateLimiter`], tracks unacknowledged sends in a
//! [`confirm::ConfirmationTracker`] and spills to the disk-backed
//! [`cache::OverflowCache`] whenever no connection can take the entry.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod byte_counter;
pub mod cache;
pub mod config;
pub mod confirm;
pub mod constants;
pub mod coordinator;
pub mod entry;
pub mod errors;
pub mod processor;
pub mod rate_limiter;
pub mod registry;
pub mod stats;
pub mod tags;
pub mod transport;
