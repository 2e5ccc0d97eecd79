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

//! Session events and the sinks that deliver them.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::borrow::Cow;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::state::SessionRole;

/// One physical read from the transport.
///
/// Carries the raw bytes. Chunk boundaries follow the reads, not any
/// application message boundary.
#[derive(Debug, Clone)]
pub struct InboundChunk {
    seq: u64,
    bytes: Vec<u8>,
    received_at: DateTime<Local>,
}

impl InboundChunk {
    pub fn new(seq: u64, bytes: Vec<u8>) -> Self {
        Self {
            seq,
            bytes,
            received_at: Local::now(),
        }
    }

    /// Arrival order within the session, starting at 0 for each transport.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn received_at(&self) -> DateTime<Local> {
        self.received_at
    }

    /// Payload decoded as UTF-8; invalid sequences become U+FFFD.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Requested,
    /// The remote closed the stream.
    EndOfStream,
    /// A read failed.
    ReadFailed(String),
    /// The session is shutting down.
    Shutdown,
}

/// Events emitted by the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A transport became active.
    Connected { role: SessionRole, peer: String },
    /// Bytes received from the peer.
    DataReceived(InboundChunk),
    /// The active transport was torn down.
    Disconnected { reason: DisconnectReason },
    /// A background operation failed with no caller waiting.
    Error(String),
}

/// Outward notification channel.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn publish(&self, event: SessionEvent);
}

#[async_trait]
impl EventSink for mpsc::Sender<SessionEvent> {
    async fn publish(&self, event: SessionEvent) {
        if self.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }
}

#[async_trait]
impl EventSink for mpsc::UnboundedSender<SessionEvent> {
    async fn publish(&self, event: SessionEvent) {
        if self.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Fan out to every subscriber. Having none is not an error.
#[async_trait]
impl EventSink for broadcast::Sender<SessionEvent> {
    async fn publish(&self, event: SessionEvent) {
        let _ = self.send(event);
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: SessionEvent) {}
}
