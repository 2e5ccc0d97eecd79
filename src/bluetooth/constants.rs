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

//! RFCOMM constants shared by listeners and dialers.

use uuid::Uuid;

/// Standard Serial Port Profile UUID.
///
/// Both sides must use the same service UUID; a mismatch never connects.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Service record name registered with SDP.
pub const SERVICE_NAME: &str = "BluetoothChatServer";

/// Session tuning defaults.
pub mod defaults {
    /// Bytes requested from the transport per read.
    pub const READ_BUFFER_SIZE: usize = 1024;

    /// Capacity of the event channel created by the binary.
    pub const EVENT_CAPACITY: usize = 32;

    /// How long shutdown waits for background tasks before aborting them.
    pub const SHUTDOWN_GRACE_MS: u64 = 2000;
}
