// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unit of shipped data and its binary body encoding.
//!
//! The body encoding is shared by the overflow cache file and the connection frames:
//!
//! ```text
//! [i64 seconds][u32 nanos][u16 tag][u8 addr kind][0, 4 or 16 addr bytes][payload]
//! ```
//!
//! All integers are big-endian. The payload runs to the end of the body, so the
//! enclosing frame is responsible for carrying the body length.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use derive_more::{Display, From, Into};

use crate::errors::DecodeError;

const ADDR_NONE: u8 = 0;
const ADDR_V4: u8 = 4;
const ADDR_V6: u8 = 6;

/// Size of the fixed part of an encoded body (timestamp, tag and address kind).
pub const BODY_HEADER_SIZE: usize = 8 + 4 + 2 + 1;

/// Compact numeric identifier of a negotiated tag name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into)]
pub struct EntryTag(pub u16);

impl EntryTag {
    /// Identifier of the pipeline's own diagnostic channel.
    pub const INTERNAL: EntryTag = EntryTag(u16::MAX);

    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }
}

/// A single timestamped, tagged record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub ts: SystemTime,
    pub tag: EntryTag,
    pub src: Option<IpAddr>,
    pub data: Vec<u8>,
}

impl Entry {
    /// Creates an entry stamped with the current time and no source address.
    pub fn new(tag: EntryTag, data: impl Into<Vec<u8>>) -> Self {
        Self {
            ts: SystemTime::now(),
            tag,
            src: None,
            data: data.into(),
        }
    }

    #[must_use]
    pub fn with_src(mut self, src: IpAddr) -> Self {
        self.src = Some(src);
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, ts: SystemTime) -> Self {
        self.ts = ts;
        self
    }

    /// Number of bytes `encode` appends for this entry.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let addr_len = match self.src {
            None => 0,
            Some(IpAddr::V4(_)) => 4,
            Some(IpAddr::V6(_)) => 16,
        };
        BODY_HEADER_SIZE + addr_len + self.data.len()
    }

    /// Appends the body encoding of this entry to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        let (secs, nanos) = split_timestamp(self.ts);
        out.extend_from_slice(&secs.to_be_bytes());
        out.extend_from_slice(&nanos.to_be_bytes());
        out.extend_from_slice(&self.tag.0.to_be_bytes());
        match self.src {
            None => out.push(ADDR_NONE),
            Some(IpAddr::V4(addr)) => {
                out.push(ADDR_V4);
                out.extend_from_slice(&addr.octets());
            }
            Some(IpAddr::V6(addr)) => {
                out.push(ADDR_V6);
                out.extend_from_slice(&addr.octets());
            }
        }
        out.extend_from_slice(&self.data);
    }

    /// Decodes an entry from a complete body produced by [`Entry::encode`].
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        if body.len() < BODY_HEADER_SIZE {
            return Err(DecodeError::Truncated {
                needed: BODY_HEADER_SIZE,
                available: body.len(),
            });
        }
        let secs = i64::from_be_bytes(fixed(&body[0..8]));
        let nanos = u32::from_be_bytes(fixed(&body[8..12]));
        let tag = EntryTag(u16::from_be_bytes(fixed(&body[12..14])));
        let rest = &body[BODY_HEADER_SIZE..];

        let (src, data) = match body[14] {
            ADDR_NONE => (None, rest),
            ADDR_V4 => {
                if rest.len() < 4 {
                    return Err(DecodeError::Truncated {
                        needed: BODY_HEADER_SIZE + 4,
                        available: body.len(),
                    });
                }
                let octets: [u8; 4] = fixed(&rest[..4]);
                (Some(IpAddr::V4(Ipv4Addr::from(octets))), &rest[4..])
            }
            ADDR_V6 => {
                if rest.len() < 16 {
                    return Err(DecodeError::Truncated {
                        needed: BODY_HEADER_SIZE + 16,
                        available: body.len(),
                    });
                }
                let octets: [u8; 16] = fixed(&rest[..16]);
                (Some(IpAddr::V6(Ipv6Addr::from(octets))), &rest[16..])
            }
            other => return Err(DecodeError::AddressKind(other)),
        };

        let ts = join_timestamp(secs, nanos).ok_or(DecodeError::Timestamp { secs, nanos })?;
        Ok(Self {
            ts,
            tag,
            src,
            data: data.to_vec(),
        })
    }
}

// Callers always pass a slice of exactly N bytes
fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn split_timestamp(ts: SystemTime) -> (i64, u32) {
    match ts.duration_since(UNIX_EPOCH) {
        Ok(since) => (
            i64::try_from(since.as_secs()).unwrap_or(i64::MAX),
            since.subsec_nanos(),
        ),
        Err(before) => {
            let before = before.duration();
            let secs = i64::try_from(before.as_secs()).map_or(i64::MIN, |s| -s);
            match before.subsec_nanos() {
                0 => (secs, 0),
                nanos => (secs.saturating_sub(1), 1_000_000_000 - nanos),
            }
        }
    }
}

fn join_timestamp(secs: i64, nanos: u32) -> Option<SystemTime> {
    if nanos >= 1_000_000_000 {
        return None;
    }
    if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::new(secs.unsigned_abs(), nanos))
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(secs.unsigned_abs()))?
            .checked_add(Duration::from_nanos(u64::from(nanos)))
    }
}
