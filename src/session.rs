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

//! Single-connection RFCOMM session state machine.
//!
//! A [`Session`] owns at most one [`Transport`], obtained either by
//! listening (server) or dialing (client). Role transitions happen under one
//! short-lived state lock; a transition gate serializes listen, connect and
//! teardown so a new transport is never created while an old one is still
//! closing. Dial, accept and read work runs on the session's [`Worker`].

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bluetooth::{
    AcceptOutcome, AcceptWait, BoxedStream, PairedDevice, PendingAccept, RadioCapability,
    RadioPlatform, ReadPump, Transport,
};
use crate::config::Config;
use crate::error::{ErrorKind, Result, SessionError};
use crate::events::{DisconnectReason, EventSink, SessionEvent};
use crate::state::{RoleStatus, RoleWatcher, SessionRole};
use crate::worker::{StopHandle, StopSignal, Worker};

/// Completion of a background listen or dial, resolved exactly once.
#[must_use = "a completion reports whether the connection was established"]
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| Err(SessionError::cancelled("session shut down")))
        })
    }
}

/// The transport currently owned by the session.
struct ActiveLink {
    role: SessionRole,
    transport: Arc<Transport>,
    pump_stop: StopHandle,
    pump_done: oneshot::Receiver<()>,
}

enum SessionState {
    Idle,
    Listening {
        attempt: u64,
        accept: PendingAccept,
    },
    Connecting {
        attempt: u64,
        address: String,
        stop: StopHandle,
    },
    Connected(ActiveLink),
}

impl SessionState {
    fn role(&self) -> SessionRole {
        match self {
            SessionState::Idle => SessionRole::Idle,
            SessionState::Listening { .. } => SessionRole::Listening,
            SessionState::Connecting { .. } => SessionRole::Connecting,
            SessionState::Connected(link) => link.role,
        }
    }

    fn attempt(&self) -> Option<u64> {
        match self {
            SessionState::Listening { attempt, .. } | SessionState::Connecting { attempt, .. } => {
                Some(*attempt)
            }
            _ => None,
        }
    }
}

struct Shared {
    platform: Arc<dyn RadioPlatform>,
    sink: Arc<dyn EventSink>,
    config: Config,
    state: parking_lot::Mutex<SessionState>,
    gate: tokio::sync::Mutex<()>,
    role: RoleStatus,
    worker: Worker,
    next_id: AtomicU64,
}

/// Bluetooth RFCOMM session: one server or client connection at a time.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Create an idle session on `platform`, publishing events to `sink`.
    pub fn new(platform: Arc<dyn RadioPlatform>, sink: Arc<dyn EventSink>, config: Config) -> Self {
        info!(
            "Session created on {} platform (service {})",
            platform.name(),
            config.bluetooth.service_uuid
        );
        Self {
            shared: Arc::new(Shared {
                platform,
                sink,
                config,
                state: parking_lot::Mutex::new(SessionState::Idle),
                gate: tokio::sync::Mutex::new(()),
                role: RoleStatus::new(),
                worker: Worker::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current role.
    pub fn role(&self) -> SessionRole {
        self.shared.state.lock().role()
    }

    /// Watch role transitions.
    pub fn subscribe_role(&self) -> RoleWatcher {
        self.shared.role.subscribe()
    }

    /// Address of the connected peer, if any.
    pub fn peer(&self) -> Option<String> {
        match &*self.shared.state.lock() {
            SessionState::Connected(link) => Some(link.transport.peer().to_string()),
            _ => None,
        }
    }

    /// Service UUID used for listening and dialing.
    pub fn service(&self) -> Uuid {
        self.shared.config.bluetooth.service_uuid
    }

    /// Check that the device has a Bluetooth adapter.
    pub async fn initialize(&self) -> Result<RadioCapability> {
        let capability = self
            .shared
            .platform
            .capability()
            .await
            .ok_or_else(SessionError::unsupported)?;
        info!(
            "Using Bluetooth adapter: {} ({})",
            capability.name, capability.address
        );
        Ok(capability)
    }

    /// Power the radio, prompting the host if needed.
    pub async fn enable_radio(&self) -> Result<()> {
        self.shared.ensure_ready().await?;
        let platform = &self.shared.platform;

        if platform.is_enabled().await.unwrap_or(false) {
            return Ok(());
        }

        info!("Requesting Bluetooth enablement...");
        match platform.request_enable().await {
            Ok(true) => {
                info!("Bluetooth enabled successfully.");
                Ok(())
            }
            Ok(false) => {
                error!("Bluetooth enabling was denied by the user.");
                Err(SessionError::new(
                    ErrorKind::RadioDisabled,
                    "Bluetooth is required for communication. Please enable Bluetooth.",
                ))
            }
            Err(e) => Err(SessionError::new(
                ErrorKind::Platform,
                format!("Failed to enable Bluetooth: {}", e),
            )),
        }
    }

    /// List paired devices.
    pub async fn list_devices(&self) -> Result<Vec<PairedDevice>> {
        self.shared.ensure_ready().await?;
        let platform = &self.shared.platform;

        if !platform.is_enabled().await.unwrap_or(false) {
            return Err(SessionError::new(
                ErrorKind::RadioDisabled,
                "Bluetooth must be enabled to scan for devices.",
            ));
        }

        let devices = platform.list_paired().await.map_err(|e| {
            error!("Error during device scan: {}", e);
            SessionError::new(
                ErrorKind::Platform,
                format!("Error scanning devices: {}", e),
            )
        })?;
        debug!("Found {} paired devices", devices.len());
        Ok(devices)
    }

    /// Listen on the configured service UUID.
    pub async fn start_listening(&self) -> Result<Completion> {
        let service = self.service();
        self.start_listening_on(service).await
    }

    /// Bind `service` and wait in the background for exactly one peer.
    ///
    /// Bind errors are returned directly. The returned [`Completion`]
    /// resolves once the peer is accepted, or with the reason the wait ended.
    pub async fn start_listening_on(&self, service: Uuid) -> Result<Completion> {
        let shared = &self.shared;
        shared.ensure_ready().await?;
        shared.ensure_idle()?;

        if !shared.platform.is_enabled().await.unwrap_or(false) {
            return Err(SessionError::new(
                ErrorKind::BindFailed,
                "Bluetooth must be enabled to start the server.",
            ));
        }

        let _gate = shared.gate.lock().await;
        shared.ensure_idle()?;

        let acceptor = shared
            .platform
            .bind(service, &shared.config.bluetooth.service_name)
            .await
            .map_err(|e| {
                error!("Failed to start server: {}", e);
                SessionError::new(ErrorKind::BindFailed, format!("Failed to start server: {}", e))
            })?;

        let (accept, wait) = PendingAccept::new(acceptor, service);
        let attempt = shared.next_id();
        {
            let mut state = shared.state.lock();
            *state = SessionState::Listening { attempt, accept };
            shared.role.set(SessionRole::Listening);
        }
        info!("RFCOMM server listening on service {}", service);

        let (tx, rx) = oneshot::channel();
        let task_shared = Arc::clone(shared);
        let spawned = shared.worker.spawn(async move {
            task_shared.run_accept(attempt, wait, tx).await;
        });
        if !spawned {
            shared.abandon(attempt);
            return Err(SessionError::cancelled("session is shut down"));
        }

        Ok(Completion { rx })
    }

    /// Stop accepting connections. An established connection is left alone.
    pub async fn stop_listening(&self) {
        let shared = &self.shared;
        let _gate = shared.gate.lock().await;

        let mut state = shared.state.lock();
        if !matches!(*state, SessionState::Listening { .. }) {
            debug!("stop_listening: not listening");
            return;
        }

        if let SessionState::Listening { accept, .. } = mem::replace(&mut *state, SessionState::Idle) {
            accept.close();
        }
        shared.role.set(SessionRole::Idle);
        info!("Server stopped successfully.");
    }

    /// Dial `address` on the configured service UUID.
    ///
    /// Argument, capability and state errors are returned directly; the dial
    /// itself runs in the background and reports through the [`Completion`].
    pub async fn connect(&self, address: &str) -> Result<Completion> {
        let address = address.trim();
        if address.is_empty() {
            return Err(SessionError::new(
                ErrorKind::InvalidArgument,
                "Device address is required to connect. It cannot be empty.",
            ));
        }

        let shared = &self.shared;
        shared.ensure_ready().await?;
        shared.ensure_idle()?;

        if !shared.platform.is_enabled().await.unwrap_or(false) {
            return Err(SessionError::new(
                ErrorKind::ConnectFailed,
                "Bluetooth must be enabled to connect to a device.",
            ));
        }

        let _gate = shared.gate.lock().await;
        let attempt = shared.next_id();
        let (stop, signal) = StopHandle::new();
        {
            let mut state = shared.state.lock();
            if !matches!(*state, SessionState::Idle) {
                return Err(SessionError::already_active(state.role().as_str()));
            }
            *state = SessionState::Connecting {
                attempt,
                address: address.to_string(),
                stop,
            };
            shared.role.set(SessionRole::Connecting);
        }

        let (tx, rx) = oneshot::channel();
        let task_shared = Arc::clone(shared);
        let address = address.to_string();
        let spawned = shared.worker.spawn(async move {
            task_shared.run_dial(attempt, address, signal, tx).await;
        });
        if !spawned {
            shared.abandon(attempt);
            return Err(SessionError::cancelled("session is shut down"));
        }

        Ok(Completion { rx })
    }

    /// Tear down whatever is active and return to idle. Never fails.
    pub async fn disconnect(&self) {
        self.shared
            .teardown(DisconnectReason::Requested, None)
            .await;
    }

    /// Write `data` to the connected peer.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let transport = match &*self.shared.state.lock() {
            SessionState::Connected(link) => Arc::clone(&link.transport),
            _ => return Err(SessionError::not_connected()),
        };

        transport.write(data).await.map_err(|e| {
            error!("Error sending data: {}", e);
            SessionError::new(ErrorKind::WriteFailed, format!("Failed to send data: {}", e))
        })?;
        debug!("Sent {} bytes to {}", data.len(), transport.peer());
        Ok(())
    }

    /// Stop listening, disconnect, then drain the worker.
    pub async fn shutdown(&self) {
        info!("Shutting down session...");
        self.stop_listening().await;
        self.shared
            .teardown(DisconnectReason::Shutdown, None)
            .await;
        self.shared
            .worker
            .shutdown(self.shared.config.session.shutdown_grace())
            .await;
        info!("Session stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Background tasks hold the shared state; signal them so they exit.
        let previous = mem::replace(&mut *self.shared.state.lock(), SessionState::Idle);
        match previous {
            SessionState::Idle => {}
            SessionState::Listening { accept, .. } => accept.close(),
            SessionState::Connecting { stop, .. } => stop.stop(),
            SessionState::Connected(link) => link.pump_stop.stop(),
        }
        self.shared.role.set(SessionRole::Idle);
    }
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Capability, shutdown and authorization checks shared by all commands.
    async fn ensure_ready(&self) -> Result<RadioCapability> {
        if !self.worker.is_running() {
            return Err(SessionError::cancelled("session is shut down"));
        }

        let capability = self
            .platform
            .capability()
            .await
            .ok_or_else(SessionError::unsupported)?;

        if !self.platform.is_authorized().await {
            info!("Requesting Bluetooth authorization...");
            if !self.platform.request_authorization().await {
                warn!("Bluetooth authorization denied");
                return Err(SessionError::permission_denied());
            }
        }

        Ok(capability)
    }

    fn ensure_idle(&self) -> Result<()> {
        let state = self.state.lock();
        match *state {
            SessionState::Idle => Ok(()),
            ref other => Err(SessionError::already_active(other.role().as_str())),
        }
    }

    async fn run_accept(self: Arc<Self>, attempt: u64, wait: AcceptWait, tx: oneshot::Sender<Result<()>>) {
        let outcome = match self.config.session.accept_timeout() {
            Some(limit) => match tokio::time::timeout(limit, wait.accept()).await {
                Ok(outcome) => Ok(outcome),
                Err(_) => Err(limit),
            },
            None => Ok(wait.accept().await),
        };

        let result = match outcome {
            Ok(AcceptOutcome::Accepted { stream, peer }) => {
                self.establish(attempt, SessionRole::ServerConnected, stream, peer)
                    .await
            }
            Ok(AcceptOutcome::Cancelled) => {
                self.abandon(attempt);
                Err(SessionError::cancelled("listener closed"))
            }
            Ok(AcceptOutcome::Failed(e)) => {
                error!("Error accepting connection: {}", e);
                self.abandon(attempt);
                Err(SessionError::new(
                    ErrorKind::BindFailed,
                    format!("Failed to accept connection: {}", e),
                ))
            }
            Err(limit) => {
                warn!("No connection accepted within {:?}", limit);
                self.abandon(attempt);
                Err(SessionError::new(
                    ErrorKind::Timeout,
                    format!("no connection accepted within {:?}", limit),
                ))
            }
        };

        self.complete(tx, result).await;
    }

    async fn run_dial(
        self: Arc<Self>,
        attempt: u64,
        address: String,
        mut signal: StopSignal,
        tx: oneshot::Sender<Result<()>>,
    ) {
        let dial = self.dial(&address);
        let outcome = tokio::select! {
            _ = signal.stopped() => Err(SessionError::cancelled("connection attempt cancelled")),
            result = dial => result,
        };

        let result = match outcome {
            Ok(stream) => {
                self.establish(attempt, SessionRole::ClientConnected, stream, address)
                    .await
            }
            Err(e) => {
                self.abandon(attempt);
                Err(e)
            }
        };

        self.complete(tx, result).await;
    }

    /// Hand `result` to the waiting caller. Failures nobody is waiting for
    /// go to the sink instead.
    async fn complete(&self, tx: oneshot::Sender<Result<()>>, result: Result<()>) {
        if let Err(Err(e)) = tx.send(result) {
            if e.kind() != ErrorKind::Cancelled {
                self.sink.publish(SessionEvent::Error(e.to_string())).await;
            }
        }
    }

    async fn dial(&self, address: &str) -> Result<BoxedStream> {
        // Discovery slows the connection down.
        if let Err(e) = self.platform.cancel_discovery().await {
            warn!("Failed to cancel discovery: {}", e);
        }

        if !self.platform.resolve(address).await {
            error!("Bluetooth Device not found for address: {}", address);
            return Err(SessionError::new(
                ErrorKind::DeviceNotFound,
                format!("Bluetooth device not found for address: {}", address),
            ));
        }

        info!("Connecting to device with address: {}", address);
        let service = self.config.bluetooth.service_uuid;
        let connect_failed = |e: std::io::Error| {
            error!("Failed to connect to the device: {}", e);
            SessionError::new(
                ErrorKind::ConnectFailed,
                format!("Failed to connect to the device: {}", e),
            )
        };

        match self.config.session.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.platform.dial(address, service))
                .await
                .map_err(|_| {
                    SessionError::new(
                        ErrorKind::Timeout,
                        format!("connect to {} timed out after {:?}", address, limit),
                    )
                })?
                .map_err(connect_failed),
            None => self
                .platform
                .dial(address, service)
                .await
                .map_err(connect_failed),
        }
    }

    /// Install a freshly connected stream if `attempt` is still current.
    ///
    /// A stale attempt (a stop or disconnect won the race) closes its own
    /// transport so two never coexist.
    async fn establish(
        self: &Arc<Self>,
        attempt: u64,
        role: SessionRole,
        stream: BoxedStream,
        peer: String,
    ) -> Result<()> {
        let transport = Arc::new(Transport::new(self.next_id(), stream, peer));

        let Some((signal, done_tx)) = self.install(attempt, role, &transport) else {
            info!("Discarding connection to {}: attempt superseded", transport.peer());
            transport.close().await;
            return Err(SessionError::cancelled("connection attempt cancelled"));
        };

        info!("Connected to {} as {}", transport.peer(), role);
        self.sink
            .publish(SessionEvent::Connected {
                role,
                peer: transport.peer().to_string(),
            })
            .await;
        if !self.spawn_pump(&transport, signal, done_tx) {
            self.teardown(DisconnectReason::Shutdown, Some(transport.id()))
                .await;
            return Err(SessionError::cancelled("session is shut down"));
        }
        Ok(())
    }

    fn install(
        &self,
        attempt: u64,
        role: SessionRole,
        transport: &Arc<Transport>,
    ) -> Option<(StopSignal, oneshot::Sender<()>)> {
        let mut state = self.state.lock();
        let expected = match role {
            SessionRole::ServerConnected => matches!(*state, SessionState::Listening { .. }),
            SessionRole::ClientConnected => matches!(*state, SessionState::Connecting { .. }),
            _ => false,
        };
        if !expected || state.attempt() != Some(attempt) {
            return None;
        }

        let (pump_stop, signal) = StopHandle::new();
        let (done_tx, pump_done) = oneshot::channel();
        let previous = mem::replace(
            &mut *state,
            SessionState::Connected(ActiveLink {
                role,
                transport: Arc::clone(transport),
                pump_stop,
                pump_done,
            }),
        );
        if let SessionState::Listening { accept, .. } = previous {
            accept.close();
        }
        self.role.set(role);
        Some((signal, done_tx))
    }

    /// Return to idle after a failed listen or dial, if it is still current.
    fn abandon(&self, attempt: u64) {
        let mut state = self.state.lock();
        if state.attempt() == Some(attempt) {
            *state = SessionState::Idle;
            self.role.set(SessionRole::Idle);
        }
    }

    /// Start the read pump. False if no pump could be started, in which case
    /// the link must be torn down.
    fn spawn_pump(
        self: &Arc<Self>,
        transport: &Arc<Transport>,
        signal: StopSignal,
        done_tx: oneshot::Sender<()>,
    ) -> bool {
        let Some(reader) = transport.take_reader() else {
            return false;
        };
        let id = transport.id();
        let pump = ReadPump::new(
            id,
            reader,
            Arc::clone(&self.sink),
            signal,
            self.config.session.read_buffer_size,
        );

        let shared = Arc::clone(self);
        self.worker.spawn(async move {
            let exit = pump.run().await;
            let _ = done_tx.send(());
            if let Some(reason) = exit.reason() {
                shared.teardown(reason, Some(id)).await;
            }
        })
    }

    /// Move to idle and release whatever was active.
    ///
    /// With `only` set, tears down only if that transport is still the
    /// active one; the read pump uses this when its stream ends.
    async fn teardown(&self, reason: DisconnectReason, only: Option<u64>) {
        let _gate = self.gate.lock().await;

        let previous = {
            let mut state = self.state.lock();
            if let Some(id) = only {
                match &*state {
                    SessionState::Connected(link) if link.transport.id() == id => {}
                    _ => {
                        debug!("Transport {} already torn down", id);
                        return;
                    }
                }
            }
            let previous = mem::replace(&mut *state, SessionState::Idle);
            if matches!(previous, SessionState::Idle) {
                return;
            }
            previous
        };

        match previous {
            SessionState::Idle => {}
            SessionState::Listening { accept, .. } => {
                accept.close();
                self.role.set(SessionRole::Idle);
                info!("Listener closed");
            }
            SessionState::Connecting { address, stop, .. } => {
                stop.stop();
                self.role.set(SessionRole::Idle);
                info!("Connection attempt to {} cancelled", address);
            }
            SessionState::Connected(link) => {
                link.pump_stop.stop();
                // Err means the pump never ran or was aborted; either way it is gone.
                let _ = link.pump_done.await;
                link.transport.close().await;
                self.role.set(SessionRole::Idle);

                match &reason {
                    DisconnectReason::ReadFailed(e) => {
                        warn!("Connection to {} lost: {}", link.transport.peer(), e);
                        self.sink
                            .publish(SessionEvent::Error(format!(
                                "{}: {}",
                                ErrorKind::ReadFailed,
                                e
                            )))
                            .await;
                    }
                    _ => info!("Bluetooth connection disconnected ({:?})", reason),
                }
                self.sink
                    .publish(SessionEvent::Disconnected { reason })
                    .await;
            }
        }
    }
}
