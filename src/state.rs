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

//! Session role and its published status.

use std::time::Duration;
use tokio::sync::watch;

/// Role of the single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    Idle,
    Listening,
    /// A dial is in flight; no transport yet.
    Connecting,
    ServerConnected,
    ClientConnected,
}

impl SessionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionRole::Idle => "Idle",
            SessionRole::Listening => "Listening",
            SessionRole::Connecting => "Connecting...",
            SessionRole::ServerConnected => "Connected (server)",
            SessionRole::ClientConnected => "Connected (client)",
        }
    }

    /// Whether a transport exists in this role.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionRole::ServerConnected | SessionRole::ClientConnected
        )
    }
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published role, observable from any task.
#[derive(Debug)]
pub struct RoleStatus {
    tx: watch::Sender<SessionRole>,
}

impl Default for RoleStatus {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(SessionRole::Idle);
        Self { tx }
    }
}

impl RoleStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, role: SessionRole) {
        self.tx.send_if_modified(|current| {
            if *current == role {
                false
            } else {
                *current = role;
                true
            }
        });
    }

    pub fn get(&self) -> SessionRole {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> RoleWatcher {
        RoleWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiver side of [`RoleStatus`].
#[derive(Debug, Clone)]
pub struct RoleWatcher {
    rx: watch::Receiver<SessionRole>,
}

impl RoleWatcher {
    pub fn current(&self) -> SessionRole {
        *self.rx.borrow()
    }

    /// Wait until the role satisfies `predicate`.
    ///
    /// Returns the matching role, or `None` if the session is gone.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(SessionRole) -> bool,
    ) -> Option<SessionRole> {
        self.rx
            .wait_for(|role| predicate(*role))
            .await
            .ok()
            .map(|role| *role)
    }

    /// Like [`wait_for`](Self::wait_for) with a deadline.
    pub async fn wait_for_timeout(
        &mut self,
        timeout: Duration,
        predicate: impl FnMut(SessionRole) -> bool,
    ) -> Option<SessionRole> {
        tokio::time::timeout(timeout, self.wait_for(predicate))
            .await
            .ok()
            .flatten()
    }
}
