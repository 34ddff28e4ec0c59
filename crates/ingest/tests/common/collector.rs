// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal TCP collector that reads frames and acknowledges each one

use ingest::entry::Entry;
use ingest::transport::read_frame;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[allow(dead_code)]
pub struct TcpCollector {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Entry>>>,
    task: JoinHandle<()>,
}

#[allow(dead_code)]
impl TcpCollector {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind collector");
        let addr = listener.local_addr().expect("collector address");
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&received);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    while let Ok(Some((id, entry))) = read_frame(&mut reader).await {
                        sink.lock().unwrap().push(entry);
                        if writer.write_u64(id).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self {
            addr,
            received,
            task,
        }
    }

    pub fn received(&self) -> Vec<Entry> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for TcpCollector {
    fn drop(&mut self) {
        self.task.abort();
    }
}
