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

//! Bluetooth communication module.
//!
//! RFCOMM transports, listeners, the read pump and the radio platforms
//! they run on.

mod bluez;
pub mod constants;
mod listener;
mod loopback;
mod platform;
mod pump;
mod transport;

pub use bluez::BluezPlatform;
pub use constants::{SERVICE_NAME, SPP_UUID};
pub use listener::{AcceptOutcome, AcceptWait, PendingAccept};
pub use loopback::{LoopbackPlatform, RemoteService};
pub use platform::{
    Acceptor, BoxedStream, PairedDevice, RadioCapability, RadioPlatform, RfcommStream,
};
pub use pump::{PumpExit, ReadPump};
pub use transport::{Transport, TransportReader};
