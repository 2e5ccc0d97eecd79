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

//! Background read loop for the active transport.

use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info};

use super::transport::TransportReader;
use crate::events::{DisconnectReason, EventSink, InboundChunk, SessionEvent};
use crate::worker::StopSignal;

/// Why the pump loop returned.
#[derive(Debug)]
pub enum PumpExit {
    /// A stop was requested.
    Stopped,
    /// The remote closed the stream.
    EndOfStream,
    /// A read failed.
    ReadFailed(io::Error),
}

impl PumpExit {
    /// Disconnect reason for an exit the pump observed on its own.
    ///
    /// `None` for [`PumpExit::Stopped`]; whoever requested the stop owns the
    /// reason.
    pub fn reason(&self) -> Option<DisconnectReason> {
        match self {
            PumpExit::Stopped => None,
            PumpExit::EndOfStream => Some(DisconnectReason::EndOfStream),
            PumpExit::ReadFailed(e) => Some(DisconnectReason::ReadFailed(e.to_string())),
        }
    }
}

/// Drains one transport's input half into an [`EventSink`].
///
/// The pump never closes the transport. It returns how it ended and leaves
/// teardown to the session.
pub struct ReadPump {
    transport_id: u64,
    reader: TransportReader,
    sink: Arc<dyn EventSink>,
    signal: StopSignal,
    buffer_size: usize,
}

impl ReadPump {
    pub fn new(
        transport_id: u64,
        reader: TransportReader,
        sink: Arc<dyn EventSink>,
        signal: StopSignal,
        buffer_size: usize,
    ) -> Self {
        Self {
            transport_id,
            reader,
            sink,
            signal,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Run until stopped or the stream ends. The input half is dropped on return.
    pub async fn run(mut self) -> PumpExit {
        info!("Read pump started for transport {}", self.transport_id);

        let mut buf = vec![0u8; self.buffer_size];
        let mut seq = 0u64;

        loop {
            if self.signal.is_stopped() {
                debug!("Read pump {} stopped", self.transport_id);
                return PumpExit::Stopped;
            }

            let n = tokio::select! {
                biased;
                _ = self.signal.stopped() => {
                    debug!("Read pump {} interrupted", self.transport_id);
                    return PumpExit::Stopped;
                }
                result = self.reader.read(&mut buf) => match result {
                    Ok(0) => {
                        info!("Connection closed by remote");
                        return PumpExit::EndOfStream;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        error!("Read error: {}", e);
                        return PumpExit::ReadFailed(e);
                    }
                }
            };

            debug!("Received {} bytes (chunk #{})", n, seq);
            let chunk = InboundChunk::new(seq, buf[..n].to_vec());
            seq += 1;

            tokio::select! {
                biased;
                _ = self.signal.stopped() => return PumpExit::Stopped,
                _ = self.sink.publish(SessionEvent::DataReceived(chunk)) => {}
            }
        }
    }
}
