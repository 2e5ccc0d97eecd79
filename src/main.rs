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

//! SPP bridge command line.
//!
//! ```text
//! spp-bridge [--simulate] devices
//! spp-bridge [--simulate] listen
//! spp-bridge [--simulate] connect <address>
//! ```
//!
//! While connected, each stdin line is sent to the peer and inbound data is
//! printed to stdout.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use spp_bridge::bluetooth::{BluezPlatform, LoopbackPlatform, RadioPlatform};
use spp_bridge::{Completion, Config, Session, SessionEvent, SessionRole};

/// Address of the echo peer offered by `--simulate`.
const SIMULATED_PEER: &str = "00:00:00:00:00:02";

/// How long to wait for queued events to print on exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

enum Command {
    Devices,
    Listen,
    Connect(String),
}

struct Args {
    simulate: bool,
    command: Command,
}

fn usage() -> &'static str {
    "usage: spp-bridge [--simulate] <devices | listen | connect <address>>"
}

fn parse_args() -> Result<Args> {
    let mut simulate = false;
    let mut rest = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--simulate" => simulate = true,
            "-h" | "--help" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            _ => rest.push(arg),
        }
    }

    let command = match rest.first().map(String::as_str) {
        Some("devices") => Command::Devices,
        Some("listen") => Command::Listen,
        Some("connect") => match rest.get(1) {
            Some(address) => Command::Connect(address.clone()),
            None => bail!("connect needs an address\n{}", usage()),
        },
        _ => bail!("{}", usage()),
    };

    Ok(Args { simulate, command })
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spp_bridge=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let args = parse_args()?;
    info!("Starting SPP bridge v{}...", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("Configuration loaded from {}", Config::default_path().display());

    let platform: Arc<dyn RadioPlatform> = if args.simulate {
        Arc::new(simulated_platform(&config))
    } else {
        let bluez = BluezPlatform::new().await;
        if let Some(name) = &config.bluetooth.device_name {
            if let Err(e) = bluez.set_name(name).await {
                warn!("Failed to set Bluetooth name: {}", e);
            }
        }
        if matches!(args.command, Command::Listen) && config.bluetooth.discoverable {
            if let Err(e) = bluez.set_discoverable(true).await {
                warn!("Failed to make adapter discoverable: {}", e);
            }
        }
        Arc::new(bluez)
    };

    let (event_tx, event_rx) = mpsc::channel(config.session.event_capacity.max(1));
    let printer = print_events(event_rx);
    let session = Session::new(Arc::clone(&platform), Arc::new(event_tx), config);

    let result = run(&session, args.command).await;

    session.shutdown().await;
    // The sink goes with the session; the printer ends once it has drained.
    drop(session);
    if tokio::time::timeout(DRAIN_TIMEOUT, printer).await.is_err() {
        warn!("Event printer did not finish");
    }
    result
}

async fn run(session: &Session, command: Command) -> Result<()> {
    session.initialize().await?;
    session.enable_radio().await?;

    match command {
        Command::Devices => {
            let devices = session.list_devices().await?;
            println!("{}", serde_json::to_string_pretty(&devices)?);
            Ok(())
        }
        Command::Listen => {
            let completion = session.start_listening().await?;
            info!("Waiting for a peer on service {}...", session.service());
            run_interactive(session, completion).await
        }
        Command::Connect(address) => {
            let completion = session.connect(&address).await?;
            run_interactive(session, completion).await
        }
    }
}

/// Loopback radio with one echo peer; in listen mode the peer also dials in.
fn simulated_platform(config: &Config) -> LoopbackPlatform {
    let platform = LoopbackPlatform::new();
    let service = config.bluetooth.service_uuid;
    let mut remote = platform.add_peer(SIMULATED_PEER, Some("Echo"), service);

    tokio::spawn(async move {
        while let Some(stream) = remote.accept().await {
            tokio::spawn(echo(stream));
        }
    });

    let dialer = platform.clone();
    tokio::spawn(async move {
        for _ in 0..50 {
            if dialer.is_bound(service) {
                match dialer.peer_dial(SIMULATED_PEER, service) {
                    Ok(stream) => {
                        echo(stream).await;
                        return;
                    }
                    Err(e) => warn!("Simulated peer could not dial: {}", e),
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    });

    platform
}

async fn echo(mut stream: tokio::io::DuplexStream) {
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Connected { role, peer } => format!("* connected to {} ({})", peer, role),
        SessionEvent::DataReceived(chunk) => format!("< {}", chunk.text()),
        SessionEvent::Disconnected { reason } => format!("* disconnected ({:?})", reason),
        SessionEvent::Error(message) => format!("! {}", message),
    }
}

/// Print events until every sender is gone. Returns how many were printed.
fn print_events(mut events: mpsc::Receiver<SessionEvent>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut printed = 0;
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Error(_) => eprintln!("{}", describe(&event)),
                _ => println!("{}", describe(&event)),
            }
            printed += 1;
        }
        printed
    })
}

async fn run_interactive(session: &Session, completion: Completion) -> Result<()> {
    tokio::select! {
        result = completion => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            return Ok(());
        }
    }

    let mut roles = session.subscribe_role();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(e) = session.send(format!("{}\n", line).as_bytes()).await {
                        error!("{}", e);
                    }
                }
                None => {
                    info!("stdin closed");
                    break;
                }
            },
            _ = roles.wait_for(|role| role == SessionRole::Idle) => {
                info!("Connection closed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    session.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spp_bridge::bluetooth::SPP_UUID;
    use spp_bridge::DisconnectReason;

    #[test]
    fn test_describe_events() {
        let event = SessionEvent::Disconnected {
            reason: DisconnectReason::Requested,
        };
        assert_eq!(describe(&event), "* disconnected (Requested)");
        assert_eq!(describe(&SessionEvent::Error("boom".into())), "! boom");
    }

    #[tokio::test]
    async fn test_printer_drains_final_disconnect() {
        let platform = LoopbackPlatform::new();
        let mut remote = platform.add_peer(SIMULATED_PEER, None, SPP_UUID);
        let (tx, rx) = mpsc::channel(8);
        let printer = print_events(rx);
        let session = Session::new(Arc::new(platform.clone()), Arc::new(tx), Config::default());

        session.connect(SIMULATED_PEER).await.unwrap().await.unwrap();
        let _peer = remote.accept().await.unwrap();
        session.disconnect().await;
        session.shutdown().await;
        drop(session);

        let printed = tokio::time::timeout(DRAIN_TIMEOUT, printer)
            .await
            .expect("printer must end once the session is gone")
            .unwrap();
        // Connected, then Disconnected.
        assert_eq!(printed, 2);
    }
}
