// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unread-byte accounting for a backing file.
//!
//! A [`ByteCounter`] is shared by one [`CountingWriter`] and one [`CountingReader`]
//! over the same file; the count is always bytes written minus bytes read.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ByteCounter {
    count: Arc<AtomicU64>,
}

impl ByteCounter {
    /// Attaches a counter to `file`, starting from its current size so a backlog
    /// carried over from a previous process is reported.
    pub fn new(file: &File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            count: Arc::new(AtomicU64::new(len)),
        })
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn writer<W: Write>(&self, inner: W) -> CountingWriter<W> {
        CountingWriter {
            inner,
            count: Arc::clone(&self.count),
        }
    }

    pub fn reader<R: Read>(&self, inner: R) -> CountingReader<R> {
        CountingReader {
            inner,
            count: Arc::clone(&self.count),
        }
    }
}

#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    count: Arc<AtomicU64>,
}

impl<W> CountingWriter<W> {
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        // the writer only ever adds, so the count cannot drop below `current`
        let current = self.count.load(Ordering::Acquire);
        self.count.fetch_sub((n as u64).min(current), Ordering::AcqRel);
        Ok(n)
    }
}

impl<R: Seek> CountingReader<R> {
    /// Repositions the underlying reader to the start without touching the count.
    /// Only valid once the file has been truncated to zero.
    pub(crate) fn rewind_truncated(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(0)).map(|_| ())
    }
}
