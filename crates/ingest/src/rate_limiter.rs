// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregate egress cap shared by every connection.
//!
//! A single [`RateLimiter`] owns one token bucket. Every [`ThrottledTransport`]
//! produced by [`RateLimiter::wrap`] draws from that same bucket, so the configured
//! rate bounds the sum of bytes written across all destinations.
//!
//! Waiting is reservation based: a writer takes its tokens up front (the balance may
//! go negative) and sleeps until the bucket would have refilled them. A reservation
//! that cannot be honored before the write deadline is returned untouched.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{RateError, TransportError};
use crate::transport::Transport;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: usize,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Takes `n` tokens and returns how long to wait before they are earned, or
    /// `None` (taking nothing) when that wait would exceed `max_wait`.
    fn reserve(&self, n: usize, now: Instant, max_wait: Option<Duration>) -> Option<Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst as f64);
        state.last = now;

        let remaining = state.tokens - n as f64;
        let wait = if remaining >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-remaining / self.rate)
        };
        if max_wait.is_some_and(|max| wait > max) {
            return None;
        }
        state.tokens = remaining;
        Some(wait)
    }

    fn refund(&self, n: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tokens = (state.tokens + n as f64).min(self.burst as f64);
    }
}

/// Parent limiter; cloning shares the bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<TokenBucket>,
}

impl RateLimiter {
    /// `rate` is bytes per second. The burst is `rate * burst_multiplier`, never less
    /// than one second of rate.
    pub fn new(rate: i64, burst_multiplier: f64) -> Result<Self, RateError> {
        if rate <= 0 {
            return Err(RateError::InvalidRate(rate));
        }
        if !burst_multiplier.is_finite() {
            return Err(RateError::InvalidBurstMultiplier(burst_multiplier));
        }
        let burst = (rate as f64 * burst_multiplier.max(1.0)).min(usize::MAX as f64) as usize;
        Ok(Self {
            bucket: Arc::new(TokenBucket {
                rate: rate as f64,
                burst,
                state: Mutex::new(BucketState {
                    tokens: burst as f64,
                    last: Instant::now(),
                }),
            }),
        })
    }

    /// Bytes per second.
    #[must_use]
    pub fn rate(&self) -> u64 {
        self.bucket.rate as u64
    }

    /// Largest number of bytes a single wait may request.
    #[must_use]
    pub fn burst(&self) -> usize {
        self.bucket.burst
    }

    /// Waits until `n` bytes may be sent. Fails with a timeout, consuming nothing, if
    /// the tokens cannot be earned by `deadline`; a cancelled wait returns its tokens.
    pub async fn wait_n(
        &self,
        n: usize,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if n == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let max_wait = deadline.map(|d| d.saturating_duration_since(now));
        let Some(wait) = self.bucket.reserve(n, now, max_wait) else {
            return Err(TransportError::Timeout { written: 0 });
        };
        if wait.is_zero() {
            return Ok(());
        }
        tokio::select! {
            () = tokio::time::sleep(wait) => Ok(()),
            () = cancel.cancelled() => {
                self.bucket.refund(n);
                Err(TransportError::Cancelled { written: 0 })
            }
        }
    }

    /// Wraps a connection so its writes draw from this limiter's bucket.
    pub fn wrap(&self, inner: Box<dyn Transport>) -> ThrottledTransport {
        ThrottledTransport {
            inner,
            limiter: Some(self.clone()),
            write_timeout: None,
            write_deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// A connection whose writes are chunked to the burst size and paced by a shared
/// [`RateLimiter`]. Built unthrottled when no limit is configured.
pub struct ThrottledTransport {
    inner: Box<dyn Transport>,
    limiter: Option<RateLimiter>,
    write_timeout: Option<Duration>,
    write_deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl ThrottledTransport {
    pub fn unthrottled(inner: Box<dyn Transport>) -> Self {
        Self {
            inner,
            limiter: None,
            write_timeout: None,
            write_deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Deadline applied to each write that has no explicit deadline set.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Token that aborts any in-progress wait for tokens.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Writes every byte of `buf` or fails. On failure the error carries how many
    /// bytes already reached the inner transport; they are not rolled back.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let deadline = self
            .write_deadline
            .or_else(|| self.write_timeout.map(|t| Instant::now() + t));
        self.inner.set_write_deadline(deadline);

        let chunk_len = self
            .limiter
            .as_ref()
            .map_or(buf.len(), RateLimiter::burst)
            .max(1);
        let mut written = 0;
        for chunk in buf.chunks(chunk_len) {
            if let Some(limiter) = &self.limiter {
                limiter
                    .wait_n(chunk.len(), deadline, &self.cancel)
                    .await
                    .map_err(|e| e.after(written))?;
            }
            let mut offset = 0;
            while offset < chunk.len() {
                let n = self
                    .inner
                    .write(&chunk[offset..])
                    .await
                    .map_err(|e| e.after(written))?;
                if n == 0 {
                    return Err(TransportError::Closed);
                }
                offset += n;
                written += n;
            }
        }
        Ok(written)
    }
}

#[async_trait]
impl Transport for ThrottledTransport {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.write_all(buf).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.cancel.cancel();
        self.inner.close().await
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.inner.set_read_deadline(deadline);
    }
}

/// Parses a human rate into bytes per second.
///
/// Plain numbers are bytes per second. Suffixes ending in `bps` are bits per second
/// with decimal prefixes (`kbps`, `Mbps`, `Gbps`); suffixes ending in `Bps` are bytes
/// per second with binary prefixes (`KBps`, `MBps`, `GBps`).
pub fn parse_rate(input: &str) -> Result<i64, RateError> {
    let err = || RateError::Parse(input.to_string());
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    let value: f64 = number.parse().map_err(|_| err())?;

    let suffix = suffix.trim();
    let bytes_per_sec = if suffix.is_empty() {
        value
    } else if let Some(prefix) = suffix.strip_suffix("Bps") {
        value
            * match prefix {
                "" => 1.0,
                "K" | "k" => 1024.0,
                "M" | "m" => 1024.0 * 1024.0,
                "G" | "g" => 1024.0 * 1024.0 * 1024.0,
                _ => return Err(err()),
            }
    } else if let Some(prefix) = suffix.strip_suffix("bps") {
        let bits = value
            * match prefix {
                "" => 1.0,
                "K" | "k" => 1e3,
                "M" | "m" => 1e6,
                "G" | "g" => 1e9,
                _ => return Err(err()),
            };
        bits / 8.0
    } else {
        return Err(err());
    };

    if !bytes_per_sec.is_finite() || bytes_per_sec > i64::MAX as f64 {
        return Err(err());
    }
    let rate = bytes_per_sec as i64;
    if rate <= 0 {
        return Err(RateError::InvalidRate(rate));
    }
    Ok(rate)
}
