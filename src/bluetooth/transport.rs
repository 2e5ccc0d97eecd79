// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Connected RFCOMM transport.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::platform::BoxedStream;
use crate::worker::{StopHandle, StopSignal};

/// Upper bound on flushing the output half during close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Input half of a transport, owned by the read pump while it runs.
pub type TransportReader = ReadHalf<BoxedStream>;

/// A live, connected byte stream.
///
/// The stream is split on construction. The read pump takes the input half;
/// the output half stays here for `write`. `close` interrupts any blocked
/// write, drops the input half (if the pump never took it), shuts down the
/// output half and releases the socket. Closing twice is a no-op.
pub struct Transport {
    id: u64,
    peer: String,
    reader: parking_lot::Mutex<Option<TransportReader>>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    closed: AtomicBool,
    closing: StopHandle,
    closing_signal: StopSignal,
}

impl Transport {
    /// Wrap a connected stream.
    pub fn new(id: u64, stream: BoxedStream, peer: impl Into<String>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (closing, closing_signal) = StopHandle::new();
        Self {
            id,
            peer: peer.into(),
            reader: parking_lot::Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            closing,
            closing_signal,
        }
    }

    /// Session-unique id of this transport.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote endpoint address.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take the input half. Only the first caller gets it.
    pub fn take_reader(&self) -> Option<TransportReader> {
        self.reader.lock().take()
    }

    /// Write all bytes and flush.
    ///
    /// A concurrent `close` aborts the write, which then fails with
    /// `NotConnected`.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let closed = || io::Error::new(io::ErrorKind::NotConnected, "transport closed");
        let mut closing = self.closing_signal.clone();
        if closing.is_stopped() {
            return Err(closed());
        }

        tokio::select! {
            biased;
            _ = closing.stopped() => Err(closed()),
            result = async {
                let mut guard = self.writer.lock().await;
                let writer = guard.as_mut().ok_or_else(closed)?;
                writer.write_all(data).await?;
                writer.flush().await
            } => result,
        }
    }

    /// Close input, then output, then the socket.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Transport {} already closed", self.id);
            return;
        }

        // Writers blocked on a peer that stopped reading drop the lock here.
        self.closing.stop();
        drop(self.reader.lock().take());

        if let Some(mut writer) = self.writer.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Error closing output stream of transport {}: {}", self.id, e)
                }
                Err(_) => warn!("Output stream of transport {} did not drain", self.id),
            }
        }

        debug!("Transport {} to {} closed", self.id, self.peer);
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let (local, mut remote) = tokio::io::duplex(64);
        let transport = Transport::new(1, Box::new(local), "peer");

        transport.write(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_double_close_is_noop() {
        let (local, mut remote) = tokio::io::duplex(64);
        let transport = Transport::new(2, Box::new(local), "peer");

        transport.close().await;
        transport.close().await;
        assert!(transport.is_closed());

        // Both halves dropped: the peer sees end of stream.
        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (local, _remote) = tokio::io::duplex(64);
        let transport = Transport::new(3, Box::new(local), "peer");
        transport.close().await;

        let err = transport.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_close_interrupts_blocked_write() {
        // Small buffer and a peer that never reads: the write parks.
        let (local, _remote) = tokio::io::duplex(16);
        let transport = std::sync::Arc::new(Transport::new(5, Box::new(local), "peer"));

        let writer = std::sync::Arc::clone(&transport);
        let pending = tokio::spawn(async move { writer.write(&[0u8; 4096]).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        tokio::time::timeout(std::time::Duration::from_secs(2), transport.close())
            .await
            .expect("close must not wait for a blocked write");

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_reader_taken_once() {
        let (local, _remote) = tokio::io::duplex(64);
        let transport = Transport::new(4, Box::new(local), "peer");
        assert!(transport.take_reader().is_some());
        assert!(transport.take_reader().is_none());
    }
}
