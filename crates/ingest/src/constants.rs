// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Name of the tag reserved for the pipeline's own diagnostic entries.
pub const INTERNAL_TAG_NAME: &str = "internal";

/// Longest tag name accepted during negotiation, in bytes.
pub const MAX_TAG_LENGTH: usize = 4096;

/// Characters that may never appear in a tag name. Whitespace is rejected separately.
pub const FORBIDDEN_TAG_CHARS: &str = r#"!@#$%^&*()=+<>,.:;"'{}[]|\"#;

pub const DEFAULT_MAX_UNCONFIRMED: usize = 1024;
pub const DEFAULT_CACHE_MEMORY_ENTRIES: usize = 4096;
pub const DEFAULT_RATE_BURST_MULTIPLIER: f64 = 1.0;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Reconnect backoff doubles from MIN up to MAX
pub const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(250);
pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub const DRAIN_INTERVAL: Duration = Duration::from_millis(250);
pub const CONFIRM_CHECK_INTERVAL: Duration = Duration::from_millis(500);
pub const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Drained bytes after which an unbounded overflow cache file is compacted.
pub const CACHE_COMPACT_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Largest single record body the overflow cache and wire codec will accept.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;
