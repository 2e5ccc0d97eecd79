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

//! Background execution context shared by accept waits and read pumps.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Cooperative stop flag.
///
/// Cloned into a background task, checked before each blocking step and
/// awaited alongside it so a stop also interrupts the blocked step.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

/// Owning side of a [`StopSignal`].
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn new() -> (Self, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, StopSignal { rx })
    }

    /// Request a stop. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop is requested or the handle is dropped.
    pub async fn stopped(&mut self) {
        // Err means the handle is gone, which counts as a stop.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Tracks background tasks so shutdown can wait for them.
pub struct Worker {
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl Worker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn a task. Returns false once the worker has been shut down.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.tasks.lock();
        match guard.as_mut() {
            Some(tasks) => {
                // Reap finished tasks so the set does not grow unbounded.
                while tasks.try_join_next().is_some() {}
                tasks.spawn(task);
                true
            }
            None => {
                warn!("Worker is shut down, task dropped");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Wait up to `grace` for in-flight tasks, then abort the rest.
    pub async fn shutdown(&self, grace: Duration) {
        let Some(mut tasks) = self.tasks.lock().take() else {
            return;
        };

        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} background task(s) still running after {:?}, aborting",
                tasks.len(),
                grace
            );
            tasks.shutdown().await;
        } else {
            debug!("Worker drained");
        }
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}
