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

//! BlueZ radio platform.
//!
//! Services are registered as RFCOMM profiles keyed by the service UUID, so
//! BlueZ publishes the SDP record and routes connections for us.

use anyhow::Result;
use async_trait::async_trait;
use bluer::rfcomm::{Profile, ProfileHandle, ReqError, Role};
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use std::io;
use std::pin::Pin;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::platform::{Acceptor, BoxedStream, PairedDevice, RadioCapability, RadioPlatform};

fn io_error(e: bluer::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn no_adapter() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "no Bluetooth adapter")
}

/// Linux BlueZ platform.
pub struct BluezPlatform {
    session: Option<Session>,
    adapter: Option<Adapter>,
}

impl BluezPlatform {
    /// Connect to BlueZ. A missing daemon or adapter is not an error; the
    /// platform then reports no capability.
    pub async fn new() -> Self {
        info!("Initializing BlueZ platform...");

        let session = match Session::new().await {
            Ok(session) => {
                info!("BlueZ session created");
                Some(session)
            }
            Err(e) => {
                error!("Bluetooth is not supported on this device: {}", e);
                None
            }
        };

        let adapter = match &session {
            Some(session) => match session.default_adapter().await {
                Ok(adapter) => {
                    info!("Using Bluetooth adapter: {}", adapter.name());
                    Some(adapter)
                }
                Err(e) => {
                    error!("No default Bluetooth adapter: {}", e);
                    None
                }
            },
            None => None,
        };

        Self { session, adapter }
    }

    fn adapter(&self) -> io::Result<&Adapter> {
        self.adapter.as_ref().ok_or_else(no_adapter)
    }

    fn session(&self) -> io::Result<&Session> {
        self.session.as_ref().ok_or_else(no_adapter)
    }

    /// Set the adapter alias.
    pub async fn set_name(&self, name: &str) -> Result<()> {
        self.adapter()?.set_alias(name.to_string()).await?;
        info!("Bluetooth name set to: {}", name);
        Ok(())
    }

    /// Make the adapter discoverable and pairable.
    pub async fn set_discoverable(&self, discoverable: bool) -> Result<()> {
        let adapter = self.adapter()?;
        adapter.set_discoverable(discoverable).await?;
        adapter.set_pairable(discoverable).await?;
        info!(
            "Adapter is {}",
            if discoverable {
                "discoverable and pairable"
            } else {
                "hidden"
            }
        );
        Ok(())
    }

    fn parse_address(address: &str) -> io::Result<Address> {
        address.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid Bluetooth address: {}", address),
            )
        })
    }

    fn profile(service: Uuid, role: Role, name: Option<&str>) -> Profile {
        Profile {
            uuid: service,
            name: name.map(str::to_string),
            role: Some(role),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        }
    }
}

/// Server-side profile registration waiting for connect requests.
struct BluezAcceptor {
    handle: Pin<Box<ProfileHandle>>,
}

#[async_trait]
impl Acceptor for BluezAcceptor {
    async fn accept(&mut self) -> io::Result<(BoxedStream, String)> {
        let request = self.handle.next().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "profile unregistered")
        })?;

        let peer = request.device().to_string();
        let stream: BoxedStream = Box::new(Box::pin(request.accept().map_err(io_error)?));
        Ok((stream, peer))
    }
}

#[async_trait]
impl RadioPlatform for BluezPlatform {
    fn name(&self) -> &'static str {
        "bluez"
    }

    async fn capability(&self) -> Option<RadioCapability> {
        let adapter = self.adapter.as_ref()?;
        let address = match adapter.address().await {
            Ok(address) => address.to_string(),
            Err(e) => {
                warn!("Could not read adapter address: {}", e);
                return None;
            }
        };
        Some(RadioCapability {
            name: adapter.name().to_string(),
            address,
        })
    }

    async fn is_authorized(&self) -> bool {
        // Access is governed by the D-Bus policy; a live session means granted.
        self.session.is_some()
    }

    async fn request_authorization(&self) -> bool {
        self.session.is_some()
    }

    async fn is_enabled(&self) -> io::Result<bool> {
        self.adapter()?.is_powered().await.map_err(io_error)
    }

    async fn request_enable(&self) -> io::Result<bool> {
        let adapter = self.adapter()?;
        if !adapter.is_powered().await.map_err(io_error)? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await.map_err(io_error)?;
        }
        adapter.is_powered().await.map_err(io_error)
    }

    async fn list_paired(&self) -> io::Result<Vec<PairedDevice>> {
        let adapter = self.adapter()?;
        let mut devices = Vec::new();

        for addr in adapter.device_addresses().await.map_err(io_error)? {
            let device = adapter.device(addr).map_err(io_error)?;
            if device.is_paired().await.map_err(io_error)? {
                let name = device.alias().await.ok();
                devices.push(PairedDevice {
                    address: addr.to_string(),
                    name,
                });
            }
        }

        Ok(devices)
    }

    async fn cancel_discovery(&self) -> io::Result<()> {
        // BlueZ ties discovery to the D-Bus client that started it and this
        // crate never starts one; another client's scan cannot be stopped.
        if self.adapter()?.is_discovering().await.map_err(io_error)? {
            warn!("Adapter is discovering; the connection may be slow");
        }
        Ok(())
    }

    async fn bind(&self, service: Uuid, name: &str) -> io::Result<Box<dyn Acceptor>> {
        let profile = Self::profile(service, Role::Server, Some(name));
        let handle = self
            .session()?
            .register_profile(profile)
            .await
            .map_err(io_error)?;
        info!("SPP service '{}' registered (UUID: {})", name, service);

        Ok(Box::new(BluezAcceptor {
            handle: Box::pin(handle),
        }))
    }

    async fn resolve(&self, address: &str) -> bool {
        let Ok(addr) = Self::parse_address(address) else {
            return false;
        };
        let Ok(adapter) = self.adapter() else {
            return false;
        };
        match adapter.device_addresses().await {
            Ok(known) => known.contains(&addr),
            Err(e) => {
                warn!("Could not list devices: {}", e);
                false
            }
        }
    }

    async fn dial(&self, address: &str, service: Uuid) -> io::Result<BoxedStream> {
        let addr = Self::parse_address(address)?;
        let device = self.adapter()?.device(addr).map_err(io_error)?;

        let profile = Self::profile(service, Role::Client, None);
        let mut handle = Box::pin(
            self.session()?
                .register_profile(profile)
                .await
                .map_err(io_error)?,
        );

        // BlueZ answers connect_profile by handing us a connect request on
        // the registered profile; wait for whichever comes first.
        let connect = device.connect_profile(&service);
        tokio::pin!(connect);
        let mut connect_done = false;

        loop {
            tokio::select! {
                result = &mut connect, if !connect_done => {
                    connect_done = true;
                    result.map_err(io_error)?;
                    debug!("connect_profile to {} completed", addr);
                }
                request = handle.next() => {
                    let request = request.ok_or_else(|| {
                        io::Error::new(io::ErrorKind::BrokenPipe, "profile unregistered")
                    })?;
                    if request.device() == addr {
                        let stream: BoxedStream =
                            Box::new(Box::pin(request.accept().map_err(io_error)?));
                        return Ok(stream);
                    }
                    debug!("Rejecting unexpected connection from {}", request.device());
                    request.reject(ReqError::Rejected);
                }
            }
        }
    }
}
