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

//! Session error types.

use std::fmt;
use thiserror::Error;

/// Category of a session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No local Bluetooth adapter.
    UnsupportedCapability,
    /// The host refused Bluetooth authorization.
    PermissionDenied,
    /// The adapter is present but powered off.
    RadioDisabled,
    /// A listener, dial or connection already exists.
    AlreadyActive,
    /// No transport is alive.
    NotConnected,
    /// Caller supplied an unusable argument.
    InvalidArgument,
    /// The endpoint address could not be resolved.
    DeviceNotFound,
    /// The platform refused to register the service.
    BindFailed,
    /// Transport-level connect failure.
    ConnectFailed,
    /// Write to the transport failed.
    WriteFailed,
    /// Read from the transport failed. Never surfaced to a command caller.
    ReadFailed,
    /// The operation was cancelled by a stop or disconnect.
    Cancelled,
    /// A configured connect/accept deadline expired.
    Timeout,
    /// The host platform failed outside of any connection.
    Platform,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedCapability => "unsupported capability",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::RadioDisabled => "radio disabled",
            ErrorKind::AlreadyActive => "already active",
            ErrorKind::NotConnected => "not connected",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::DeviceNotFound => "device not found",
            ErrorKind::BindFailed => "bind failed",
            ErrorKind::ConnectFailed => "connect failed",
            ErrorKind::WriteFailed => "write failed",
            ErrorKind::ReadFailed => "read failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Platform => "platform error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by session operations: a kind plus a human readable message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct SessionError {
    kind: ErrorKind,
    message: String,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn unsupported() -> Self {
        Self::new(
            ErrorKind::UnsupportedCapability,
            "Bluetooth is not supported on this device",
        )
    }

    pub fn permission_denied() -> Self {
        Self::new(
            ErrorKind::PermissionDenied,
            "Bluetooth permissions are required",
        )
    }

    pub fn already_active(what: &str) -> Self {
        Self::new(ErrorKind::AlreadyActive, format!("session is {}", what))
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorKind::NotConnected, "no active connection")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
