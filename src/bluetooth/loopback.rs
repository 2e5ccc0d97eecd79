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

//! Simulated radio connecting sessions to in-process peers.
//!
//! Streams are `tokio::io::duplex` pairs. The local end of every pair is
//! counted while alive, so callers can check how many transports exist.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::platform::{
    Acceptor, BoxedStream, PairedDevice, RadioCapability, RadioPlatform, RfcommStream,
};

/// Per-direction buffer of simulated links.
const LINK_BUFFER: usize = 64 * 1024;

type Incoming = (BoxedStream, String);

struct RemoteDevice {
    name: Option<String>,
    services: HashMap<Uuid, mpsc::UnboundedSender<DuplexStream>>,
    stalled: bool,
}

struct LoopState {
    capability: Option<RadioCapability>,
    authorized: bool,
    grant_on_request: bool,
    enabled: bool,
    enable_on_request: bool,
    discovering: bool,
    devices: HashMap<String, RemoteDevice>,
    listeners: HashMap<Uuid, mpsc::UnboundedSender<Incoming>>,
}

struct Inner {
    state: Mutex<LoopState>,
    live: Arc<AtomicUsize>,
    dials: AtomicUsize,
}

/// In-process [`RadioPlatform`].
#[derive(Clone)]
pub struct LoopbackPlatform {
    inner: Arc<Inner>,
}

/// Remote end of a simulated service offered by a peer device.
pub struct RemoteService {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl RemoteService {
    /// Wait for the next local dial to this service.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}

impl LoopbackPlatform {
    /// A powered, authorized radio with no known devices.
    pub fn new() -> Self {
        Self::with_capability(Some(RadioCapability {
            name: "loopback".to_string(),
            address: "00:00:00:00:00:01".to_string(),
        }))
    }

    /// A device without Bluetooth.
    pub fn without_radio() -> Self {
        Self::with_capability(None)
    }

    fn with_capability(capability: Option<RadioCapability>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LoopState {
                    capability,
                    authorized: true,
                    grant_on_request: true,
                    enabled: true,
                    enable_on_request: true,
                    discovering: false,
                    devices: HashMap::new(),
                    listeners: HashMap::new(),
                }),
                live: Arc::new(AtomicUsize::new(0)),
                dials: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.inner.state.lock().authorized = authorized;
    }

    pub fn set_grant_on_request(&self, grant: bool) {
        self.inner.state.lock().grant_on_request = grant;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.state.lock().enabled = enabled;
    }

    pub fn set_enable_on_request(&self, enable: bool) {
        self.inner.state.lock().enable_on_request = enable;
    }

    /// Register a paired device that offers no services.
    pub fn add_device(&self, address: &str, name: Option<&str>) {
        self.inner
            .state
            .lock()
            .devices
            .entry(address.to_string())
            .or_insert_with(|| RemoteDevice {
                name: name.map(str::to_string),
                services: HashMap::new(),
                stalled: false,
            });
    }

    /// Register a paired device offering `service`; returns its accept side.
    pub fn add_peer(&self, address: &str, name: Option<&str>, service: Uuid) -> RemoteService {
        self.add_device(address, name);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(device) = self.inner.state.lock().devices.get_mut(address) {
            device.services.insert(service, tx);
        }
        RemoteService { rx }
    }

    /// Make dials to `address` hang until cancelled.
    pub fn set_stalled(&self, address: &str, stalled: bool) {
        if let Some(device) = self.inner.state.lock().devices.get_mut(address) {
            device.stalled = stalled;
        }
    }

    pub fn start_discovery(&self) {
        self.inner.state.lock().discovering = true;
    }

    pub fn is_discovering(&self) -> bool {
        self.inner.state.lock().discovering
    }

    /// Whether a listener is bound to `service`.
    pub fn is_bound(&self, service: Uuid) -> bool {
        self.inner.state.lock().listeners.contains_key(&service)
    }

    /// Local transport streams currently alive.
    pub fn live_transports(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Number of `dial` calls made.
    pub fn dial_attempts(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Simulate remote device `from` dialing our `service`.
    pub fn peer_dial(&self, from: &str, service: Uuid) -> io::Result<DuplexStream> {
        let (local, remote) = tokio::io::duplex(LINK_BUFFER);
        self.peer_connect(from, service, local)?;
        Ok(remote)
    }

    /// Hand our listener on `service` an arbitrary local stream end, as if
    /// `from` had dialed in. Lets tests inject faulty links.
    pub fn peer_connect<S: RfcommStream>(
        &self,
        from: &str,
        service: Uuid,
        local: S,
    ) -> io::Result<()> {
        let state = self.inner.state.lock();
        let listener = state.listeners.get(&service).ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "no listener for service")
        })?;

        listener
            .send((self.track(local), from.to_string()))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;
        debug!("Peer {} dialed service {}", from, service);
        Ok(())
    }

    fn track<S: RfcommStream>(&self, stream: S) -> BoxedStream {
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        Box::new(Tracked {
            inner: Box::new(stream),
            live: Arc::clone(&self.inner.live),
        })
    }
}

impl Default for LoopbackPlatform {
    fn default() -> Self {
        Self::new()
    }
}

/// Local stream end that decrements the live counter on drop.
struct Tracked {
    inner: BoxedStream,
    live: Arc<AtomicUsize>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncRead for Tracked {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tracked {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

struct LoopbackAcceptor {
    service: Uuid,
    rx: mpsc::UnboundedReceiver<Incoming>,
    inner: Arc<Inner>,
}

#[async_trait]
impl Acceptor for LoopbackAcceptor {
    async fn accept(&mut self) -> io::Result<(BoxedStream, String)> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "listener unregistered"))
    }
}

impl Drop for LoopbackAcceptor {
    fn drop(&mut self) {
        self.inner.state.lock().listeners.remove(&self.service);
        debug!("Loopback listener for {} released", self.service);
    }
}

#[async_trait]
impl RadioPlatform for LoopbackPlatform {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn capability(&self) -> Option<RadioCapability> {
        self.inner.state.lock().capability.clone()
    }

    async fn is_authorized(&self) -> bool {
        self.inner.state.lock().authorized
    }

    async fn request_authorization(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.grant_on_request {
            state.authorized = true;
        }
        state.authorized
    }

    async fn is_enabled(&self) -> io::Result<bool> {
        Ok(self.inner.state.lock().enabled)
    }

    async fn request_enable(&self) -> io::Result<bool> {
        let mut state = self.inner.state.lock();
        if state.enable_on_request {
            state.enabled = true;
        }
        Ok(state.enabled)
    }

    async fn list_paired(&self) -> io::Result<Vec<PairedDevice>> {
        let state = self.inner.state.lock();
        let mut devices: Vec<PairedDevice> = state
            .devices
            .iter()
            .map(|(address, device)| PairedDevice {
                address: address.clone(),
                name: device.name.clone(),
            })
            .collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(devices)
    }

    async fn cancel_discovery(&self) -> io::Result<()> {
        self.inner.state.lock().discovering = false;
        Ok(())
    }

    async fn bind(&self, service: Uuid, name: &str) -> io::Result<Box<dyn Acceptor>> {
        let mut state = self.inner.state.lock();
        if state.listeners.contains_key(&service) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("service {} already registered", service),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert(service, tx);
        info!("Loopback service '{}' registered ({})", name, service);

        Ok(Box::new(LoopbackAcceptor {
            service,
            rx,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn resolve(&self, address: &str) -> bool {
        self.inner.state.lock().devices.contains_key(address)
    }

    async fn dial(&self, address: &str, service: Uuid) -> io::Result<BoxedStream> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);

        let target = {
            let state = self.inner.state.lock();
            let device = state.devices.get(address).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "device not in range")
            })?;
            if device.stalled {
                None
            } else {
                Some(device.services.get(&service).cloned().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("{} does not offer service {}", address, service),
                    )
                })?)
            }
        };

        let Some(remote_service) = target else {
            return std::future::pending().await;
        };

        let (local, remote) = tokio::io::duplex(LINK_BUFFER);
        remote_service.send(remote).map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "remote service closed")
        })?;
        Ok(self.track(local))
    }
}
