// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk-backed spillover queue.
//!
//! Entries are held in a bounded in-memory queue until it fills; after that they are
//! appended to a single backing file and drained from its head. Memory only accepts
//! entries while the file holds nothing unread, so every in-memory entry is older
//! than every on-disk entry and popping memory first keeps FIFO order.
//!
//! # File Format
//!
//! ```text
//! [u32 magic][u32 body length][u64 xxh3 of body][body]
//! ```
//!
//! The body is the [`Entry::encode`] encoding. A record cut short at the tail of the
//! file, or a tail record failing its checksum, is what a crash mid-append leaves
//! behind; it is discarded and the file truncated. The file is also truncated
//! whenever it is fully drained, and compacted down to its unread records once the
//! drained prefix grows past half the disk limit, so its length stays bounded
//! under a standing backlog.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::byte_counter::{ByteCounter, CountingReader, CountingWriter};
use crate::constants::{CACHE_COMPACT_THRESHOLD, MAX_RECORD_SIZE};
use crate::entry::Entry;
use crate::errors::{CacheError, DecodeError};

const RECORD_MAGIC: u32 = 0x4947_4331; // "IGC1"
const RECORD_HEADER_SIZE: usize = 4 + 4 + 8;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
    /// Upper bound on unread bytes held in the backing file. `None` is unbounded.
    pub max_disk_bytes: Option<u64>,
    pub memory_entries: usize,
}

#[derive(Debug)]
pub struct OverflowCache {
    path: PathBuf,
    memory: VecDeque<Entry>,
    memory_entries: usize,
    max_disk_bytes: Option<u64>,
    counter: ByteCounter,
    writer: CountingWriter<File>,
    reader: CountingReader<BufReader<File>>,
    // offset of the reader from the start of the file
    read_offset: u64,
    scratch: Vec<u8>,
}

impl OverflowCache {
    /// Opens (or creates) the cache at `config.path`. Any backlog already in the
    /// file is picked up and drained before newer entries.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;
        let counter = ByteCounter::new(&file)?;
        let reader = BufReader::new(File::open(&config.path)?);

        if counter.count() > 0 {
            debug!(
                "INGEST | overflow cache {} opened with {} bytes of backlog",
                config.path.display(),
                counter.count()
            );
        }

        Ok(Self {
            path: config.path,
            memory: VecDeque::new(),
            memory_entries: config.memory_entries,
            max_disk_bytes: config.max_disk_bytes,
            writer: counter.writer(file),
            reader: counter.reader(reader),
            counter,
            read_offset: 0,
            scratch: Vec::new(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries held in memory.
    #[must_use]
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    /// Unread bytes in the backing file.
    #[must_use]
    pub fn disk_bytes(&self) -> u64 {
        self.counter.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.counter.count() == 0
    }

    /// Puts back an entry that was popped earlier, ahead of everything else. It is
    /// held in memory regardless of the memory bound until popped or closed.
    pub fn push_front(&mut self, entry: &Entry) {
        self.memory.push_front(entry.clone());
    }

    pub fn push(&mut self, entry: &Entry) -> Result<(), CacheError> {
        if self.counter.count() == 0 && self.memory.len() < self.memory_entries {
            self.memory.push_back(entry.clone());
            return Ok(());
        }
        self.append(entry)
    }

    /// Pops the oldest entry; `Ok(None)` when the cache is empty.
    pub fn pop(&mut self) -> Result<Option<Entry>, CacheError> {
        if let Some(entry) = self.memory.pop_front() {
            return Ok(Some(entry));
        }
        if self.counter.count() == 0 {
            return Ok(None);
        }
        let entry = self.read_record()?;
        if self.counter.count() == 0 {
            self.truncate()?;
        } else if self.read_offset >= self.compact_after() {
            self.compact()?;
        }
        Ok(entry)
    }

    /// Flushes the backing file to stable storage.
    pub fn sync(&mut self) -> Result<(), CacheError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Persists in-memory entries ahead of the unread file contents and closes the file.
    /// Already-drained records are dropped from the file so a restart does not replay them.
    pub fn close(mut self) -> Result<(), CacheError> {
        if self.memory.is_empty() && self.read_offset == 0 {
            return self.sync();
        }
        let memory = std::mem::take(&mut self.memory);
        debug!(
            "INGEST | persisting {} in-memory entries to {}",
            memory.len(),
            self.path.display()
        );
        let tmp_path = self.path.with_extension("rewrite");
        let mut tmp = File::create(&tmp_path)?;
        for entry in &memory {
            encode_record(entry, &mut self.scratch)?;
            tmp.write_all(&self.scratch)?;
        }
        // remainder of the backing file is newer than anything held in memory
        io::copy(self.reader.get_mut(), &mut tmp)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn append(&mut self, entry: &Entry) -> Result<(), CacheError> {
        encode_record(entry, &mut self.scratch)?;
        if let Some(max_bytes) = self.max_disk_bytes {
            if self.counter.count() + self.scratch.len() as u64 > max_bytes {
                return Err(CacheError::Full { max_bytes });
            }
        }
        self.writer.write_all(&self.scratch)?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_record(&mut self) -> Result<Option<Entry>, CacheError> {
        let offset = self.read_offset;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        if !self.read_exact_or_tail(&mut header)? {
            return Ok(None);
        }

        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != RECORD_MAGIC {
            return self.bad_record(offset, DecodeError::Magic(magic));
        }
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > MAX_RECORD_SIZE {
            return self.bad_record(offset, DecodeError::Length(len));
        }
        let mut sum = [0u8; 8];
        sum.copy_from_slice(&header[8..16]);
        let checksum = u64::from_be_bytes(sum);

        self.scratch.resize(len, 0);
        let mut body = std::mem::take(&mut self.scratch);
        let complete = self.read_exact_or_tail(&mut body);
        self.scratch = body;
        if !complete? {
            return Ok(None);
        }
        if xxh3_64(&self.scratch) != checksum {
            return self.bad_record(offset, DecodeError::Checksum);
        }
        Entry::decode(&self.scratch)
            .map(Some)
            .map_err(|source| CacheError::Corrupt { offset, source })
    }

    /// Fills `buf`; returns false when the file ends first, which only a crash
    /// mid-append can cause. The partial tail is consumed and dropped.
    fn read_exact_or_tail(&mut self, buf: &mut [u8]) -> Result<bool, CacheError> {
        match self.reader.read_exact(buf) {
            Ok(()) => {
                self.read_offset += buf.len() as u64;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(
                    "INGEST | discarding partial record at offset {} of {}",
                    self.read_offset,
                    self.path.display()
                );
                self.truncate()?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    // A bad record at the very tail is a torn append; anywhere else it is corruption.
    fn bad_record(&mut self, offset: u64, source: DecodeError) -> Result<Option<Entry>, CacheError> {
        if self.counter.count() == 0 {
            warn!(
                "INGEST | discarding torn record at offset {offset} of {}: {source}",
                self.path.display()
            );
            self.truncate()?;
            return Ok(None);
        }
        Err(CacheError::Corrupt { offset, source })
    }

    fn compact_after(&self) -> u64 {
        self.max_disk_bytes
            .map_or(CACHE_COMPACT_THRESHOLD, |max_bytes| (max_bytes / 2).max(1))
    }

    /// Rewrites the unread records into a fresh file, dropping the drained prefix.
    fn compact(&mut self) -> Result<(), CacheError> {
        debug!(
            "INGEST | compacting {} after draining {} bytes",
            self.path.display(),
            self.read_offset
        );
        let tmp_path = self.path.with_extension("compact");
        let mut tmp = File::create(&tmp_path)?;
        // read past the counter; the unread bytes stay unread in the new file
        io::copy(self.reader.get_mut(), &mut tmp)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = self.counter.writer(file);
        self.reader = self.counter.reader(BufReader::new(File::open(&self.path)?));
        self.read_offset = 0;
        Ok(())
    }

    fn truncate(&mut self) -> Result<(), CacheError> {
        // drop whatever the reader has not consumed, then start both ends over
        io::copy(&mut self.reader, &mut io::sink())?;
        self.writer.get_ref().set_len(0)?;
        self.reader.rewind_truncated()?;
        self.read_offset = 0;
        Ok(())
    }
}

fn encode_record(entry: &Entry, out: &mut Vec<u8>) -> Result<(), CacheError> {
    let len = entry.encoded_len();
    if len > MAX_RECORD_SIZE {
        return Err(CacheError::TooLarge(len));
    }
    out.clear();
    out.reserve(RECORD_HEADER_SIZE + len);
    out.extend_from_slice(&RECORD_MAGIC.to_be_bytes());
    out.extend_from_slice(&(len as u32).to_be_bytes());
    out.extend_from_slice(&[0u8; 8]);
    entry.encode(out);
    let checksum = xxh3_64(&out[RECORD_HEADER_SIZE..]);
    out[8..16].copy_from_slice(&checksum.to_be_bytes());
    Ok(())
}
