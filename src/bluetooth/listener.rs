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

//! Listener waiting for exactly one inbound connection.

use std::io;
use tracing::{debug, info};
use uuid::Uuid;

use super::platform::{Acceptor, BoxedStream};
use crate::worker::{StopHandle, StopSignal};

/// Result of a pending accept.
pub enum AcceptOutcome {
    /// A peer connected.
    Accepted { stream: BoxedStream, peer: String },
    /// The listener was closed while waiting.
    Cancelled,
    /// The platform reported an accept error.
    Failed(io::Error),
}

impl std::fmt::Debug for AcceptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcceptOutcome::Accepted { peer, .. } => write!(f, "Accepted({})", peer),
            AcceptOutcome::Cancelled => f.write_str("Cancelled"),
            AcceptOutcome::Failed(e) => write!(f, "Failed({})", e),
        }
    }
}

/// Caller-side handle of a bound listener.
///
/// Closing it unblocks the matching [`AcceptWait`] with
/// [`AcceptOutcome::Cancelled`].
#[derive(Debug)]
pub struct PendingAccept {
    service: Uuid,
    stop: StopHandle,
}

/// Background side of a bound listener. Consumed by `accept`, so at most one
/// accept is ever outstanding.
pub struct AcceptWait {
    service: Uuid,
    acceptor: Box<dyn Acceptor>,
    signal: StopSignal,
}

impl PendingAccept {
    /// Pair a bound acceptor with its cancellation handle.
    pub fn new(acceptor: Box<dyn Acceptor>, service: Uuid) -> (Self, AcceptWait) {
        let (stop, signal) = StopHandle::new();
        (
            Self { service, stop },
            AcceptWait {
                service,
                acceptor,
                signal,
            },
        )
    }

    pub fn service(&self) -> Uuid {
        self.service
    }

    /// Close the listener. Safe to call more than once.
    pub fn close(&self) {
        if !self.stop.is_stopped() {
            debug!("Closing listener for service {}", self.service);
        }
        self.stop.stop();
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_stopped()
    }
}

impl AcceptWait {
    /// Wait for one peer or for the listener to close.
    ///
    /// The acceptor is dropped on return, releasing the bound socket.
    pub async fn accept(mut self) -> AcceptOutcome {
        if self.signal.is_stopped() {
            return AcceptOutcome::Cancelled;
        }

        info!("Waiting for a connection on service {}...", self.service);

        tokio::select! {
            _ = self.signal.stopped() => {
                debug!("Accept cancelled");
                AcceptOutcome::Cancelled
            }
            result = self.acceptor.accept() => match result {
                Ok((stream, peer)) => {
                    info!("Connection from: {}", peer);
                    AcceptOutcome::Accepted { stream, peer }
                }
                Err(e) => AcceptOutcome::Failed(e),
            }
        }
    }
}
