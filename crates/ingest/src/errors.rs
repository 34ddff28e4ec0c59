// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::entry::EntryTag;

/// Tag name validation and negotiation failures.
#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("tag name is empty")]
    Empty,

    #[error("tag name exceeds {max} bytes")]
    TooLong { max: usize },

    #[error("tag name {0:?} contains forbidden characters")]
    ForbiddenCharacters(String),

    #[error("tag pattern {pattern:?} is invalid: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    #[error("tag {0:?} is not allowed by any configured pattern")]
    NotAllowed(String),

    #[error("tag identifier space exhausted")]
    Exhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum RateError {
    #[error("rate limit must be positive, got {0}")]
    InvalidRate(i64),

    #[error("burst multiplier must be a finite number, got {0}")]
    InvalidBurstMultiplier(f64),

    #[error("unable to parse rate {0:?}")]
    Parse(String),
}

/// Failures writing to, or closing, a connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("write deadline exceeded after {written} bytes")]
    Timeout { written: usize },

    #[error("write cancelled after {written} bytes")]
    Cancelled { written: usize },

    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Rewrites the progress carried by a timeout or cancellation.
    #[must_use]
    pub fn after(self, written: usize) -> Self {
        match self {
            Self::Timeout { .. } => Self::Timeout { written },
            Self::Cancelled { .. } => Self::Cancelled { written },
            other => other,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("record truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unknown source address kind {0}")]
    AddressKind(u8),

    #[error("timestamp {secs}s {nanos}ns is out of range")]
    Timestamp { secs: i64, nanos: u32 },

    #[error("bad record magic {0:#010x}")]
    Magic(u32),

    #[error("record length {0} exceeds the maximum")]
    Length(usize),

    #[error("record checksum mismatch")]
    Checksum,
}

/// Overflow cache failures. `Full` is backpressure; the rest are fatal for the instance.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("overflow cache is full ({max_bytes} bytes on disk)")]
    Full { max_bytes: u64 },

    #[error("record of {0} bytes exceeds the overflow cache record limit")]
    TooLarge(usize),

    #[error("overflow cache is closed")]
    Closed,

    #[error("corrupt record in overflow cache at offset {offset}: {source}")]
    Corrupt { offset: u64, source: DecodeError },

    #[error("overflow cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    #[error("confirmation buffer full ({capacity} sends pending)")]
    Full { capacity: usize },

    #[error("send id {0} is already pending")]
    Duplicate(u64),

    #[error("send id {0} is not pending")]
    Unknown(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error(transparent)]
    Rate(#[from] RateError),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("processor {name} failed: {message}")]
pub struct ProcessorError {
    pub name: String,
    pub message: String,
}

/// Errors surfaced by the producer-facing coordinator API.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error(transparent)]
    Confirm(#[from] ConfirmError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error("tag {0} is not permitted")]
    TagNotPermitted(EntryTag),

    #[error("no hot connection available")]
    NotHot,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("{0} entries were not delivered before close")]
    Undelivered(usize),

    #[error("coordinator is closed")]
    Closed,
}

impl IngestError {
    /// True for backpressure signals the caller should slow down on.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::Confirm(ConfirmError::Full { .. }) | Self::Cache(CacheError::Full { .. })
        )
    }

    /// True when the failure came from a connection rather than local state.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotHot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::Invalid("cache path is required".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: cache path is required"
        );
    }

    #[test]
    fn test_capacity_and_transport_are_distinct() {
        let capacity = IngestError::from(ConfirmError::Full { capacity: 8 });
        assert!(capacity.is_capacity());
        assert!(!capacity.is_transport());

        let cache_full = IngestError::from(CacheError::Full { max_bytes: 10 });
        assert!(cache_full.is_capacity());

        let transport = IngestError::from(TransportError::Closed);
        assert!(transport.is_transport());
        assert!(!transport.is_capacity());
        assert!(IngestError::NotHot.is_transport());
    }

    #[test]
    fn test_transport_error_after_rewrites_progress() {
        let err = TransportError::Timeout { written: 0 }.after(20);
        assert!(matches!(err, TransportError::Timeout { written: 20 }));
        let err = TransportError::Closed.after(5);
        assert!(matches!(err, TransportError::Closed));
    }
}
