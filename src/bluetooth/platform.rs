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

//! Host platform interface consumed by the session.
//!
//! Everything that talks to a real radio (adapter lookup, authorization,
//! power, paired devices, sockets) sits behind [`RadioPlatform`].

use async_trait::async_trait;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// A connected RFCOMM byte stream.
pub trait RfcommStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RfcommStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed stream handed from the platform to the session.
pub type BoxedStream = Box<dyn RfcommStream>;

/// Local adapter description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioCapability {
    pub name: String,
    pub address: String,
}

/// A paired Bluetooth device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairedDevice {
    pub address: String,
    pub name: Option<String>,
}

/// A bound service waiting for inbound connections.
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next inbound connection.
    ///
    /// Returns the stream and the remote address.
    async fn accept(&mut self) -> io::Result<(BoxedStream, String)>;
}

/// Radio operations provided by the host.
#[async_trait]
pub trait RadioPlatform: Send + Sync + 'static {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Local adapter, or `None` when the device has no Bluetooth.
    async fn capability(&self) -> Option<RadioCapability>;

    /// Whether Bluetooth use is currently authorized.
    async fn is_authorized(&self) -> bool;

    /// Ask the host for authorization. Returns the resulting grant.
    async fn request_authorization(&self) -> bool;

    /// Whether the adapter is powered.
    async fn is_enabled(&self) -> io::Result<bool>;

    /// Prompt the host to power the adapter. Returns whether it is on afterwards.
    async fn request_enable(&self) -> io::Result<bool>;

    /// Enumerate bonded devices.
    async fn list_paired(&self) -> io::Result<Vec<PairedDevice>>;

    /// Stop any discovery running on the local adapter.
    async fn cancel_discovery(&self) -> io::Result<()>;

    /// Register `service` and return an acceptor for it.
    async fn bind(&self, service: Uuid, name: &str) -> io::Result<Box<dyn Acceptor>>;

    /// Whether `address` names a device the platform can reach.
    async fn resolve(&self, address: &str) -> bool;

    /// Open an RFCOMM connection to `service` on `address`.
    async fn dial(&self, address: &str, service: Uuid) -> io::Result<BoxedStream>;
}
