// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory collector and dialer whose availability tests can switch on and off

use ingest::confirm::SendId;
use ingest::entry::Entry;
use ingest::errors::TransportError;
use ingest::transport::{AckSource, Connection, Dialer, Transport, FRAME_HEADER_SIZE};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

#[derive(Default)]
struct CollectorState {
    up: bool,
    auto_ack: bool,
    dials: usize,
    received: Vec<(SendId, Entry)>,
    unacked: Vec<SendId>,
    ack_tx: Option<UnboundedSender<SendId>>,
}

/// Shared view of what a mock destination has received.
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct MockCollector {
    state: Arc<Mutex<CollectorState>>,
}

#[allow(dead_code)]
impl MockCollector {
    pub fn new(up: bool, auto_ack: bool) -> Self {
        let collector = Self::default();
        {
            let mut state = collector.state.lock().unwrap();
            state.up = up;
            state.auto_ack = auto_ack;
        }
        collector
    }

    pub fn dialer(&self, name: &str) -> Box<dyn Dialer> {
        Box::new(MockDialer {
            name: name.to_string(),
            collector: self.clone(),
        })
    }

    /// Going down drops the live connection as a collector crash would.
    pub fn set_up(&self, up: bool) {
        let mut state = self.state.lock().unwrap();
        state.up = up;
        if !up {
            state.ack_tx = None;
            state.unacked.clear();
        }
    }

    /// Enabling auto-ack also confirms everything received so far.
    pub fn set_auto_ack(&self, auto_ack: bool) {
        let mut state = self.state.lock().unwrap();
        state.auto_ack = auto_ack;
        if auto_ack {
            let pending = std::mem::take(&mut state.unacked);
            if let Some(tx) = &state.ack_tx {
                for id in pending {
                    let _ = tx.send(id);
                }
            }
        }
    }

    pub fn dials(&self) -> usize {
        self.state.lock().unwrap().dials
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .received
            .iter()
            .map(|(_, entry)| entry.data.clone())
            .collect()
    }

    /// Payloads received so far, forgetting them.
    pub fn take_payloads(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().unwrap().received)
            .into_iter()
            .map(|(_, entry)| entry.data)
            .collect()
    }

    fn receive(&self, id: SendId, entry: Entry) {
        let mut state = self.state.lock().unwrap();
        state.received.push((id, entry));
        if state.auto_ack {
            if let Some(tx) = &state.ack_tx {
                let _ = tx.send(id);
            }
        } else {
            state.unacked.push(id);
        }
    }
}

struct MockDialer {
    name: String,
    collector: MockCollector,
}

#[async_trait::async_trait]
impl Dialer for MockDialer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dial(&self) -> Result<Connection, TransportError> {
        let (tx, rx) = unbounded_channel();
        {
            let mut state = self.collector.state.lock().unwrap();
            state.dials += 1;
            if !state.up {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "collector is down",
                )));
            }
            state.ack_tx = Some(tx);
        }
        Ok(Connection {
            transport: Box::new(MockTransport {
                collector: self.collector.clone(),
                buffer: Vec::new(),
            }),
            acks: Box::new(MockAcks { rx }),
        })
    }
}

struct MockTransport {
    collector: MockCollector,
    buffer: Vec<u8>,
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        if !self.collector.state.lock().unwrap().up {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "collector is down",
            )));
        }
        self.buffer.extend_from_slice(buf);
        while self.buffer.len() >= FRAME_HEADER_SIZE {
            let id = u64::from_be_bytes(self.buffer[0..8].try_into().unwrap());
            let len = u32::from_be_bytes(self.buffer[8..12].try_into().unwrap()) as usize;
            if self.buffer.len() < FRAME_HEADER_SIZE + len {
                break;
            }
            let frame: Vec<u8> = self.buffer.drain(..FRAME_HEADER_SIZE + len).collect();
            let entry = Entry::decode(&frame[FRAME_HEADER_SIZE..]).expect("valid frame body");
            self.collector.receive(id, entry);
        }
        Ok(buf.len())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_write_deadline(&mut self, _deadline: Option<Instant>) {}

    fn set_read_deadline(&mut self, _deadline: Option<Instant>) {}
}

struct MockAcks {
    rx: UnboundedReceiver<SendId>,
}

#[async_trait::async_trait]
impl AckSource for MockAcks {
    async fn next(&mut self) -> Result<Option<SendId>, TransportError> {
        Ok(self.rx.recv().await)
    }
}
