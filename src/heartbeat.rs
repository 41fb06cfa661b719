//! Activity heartbeat for an external idle-shutdown policy.
//!
//! The proxy pings the handle after every completed request. The reporter
//! writes `last_request_unix` to the state store at most once per window;
//! pings arriving during the window are coalesced.

use crate::collaborators::{StateStore, StateUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cheap, cloneable "activity happened" signal.
#[derive(Clone)]
pub struct HeartbeatHandle {
    tx: mpsc::Sender<()>,
}

impl HeartbeatHandle {
    /// Never blocks; dropped if a ping is already pending.
    pub fn ping(&self) {
        let _ = self.tx.try_send(());
    }
}

pub struct HeartbeatReporter {
    rx: mpsc::Receiver<()>,
    store: Arc<dyn StateStore>,
    name: String,
    window: Duration,
}

impl HeartbeatReporter {
    pub fn new(
        store: Arc<dyn StateStore>,
        name: impl Into<String>,
        window: Duration,
    ) -> (Self, HeartbeatHandle) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                rx,
                store,
                name: name.into(),
                window,
            },
            HeartbeatHandle { tx },
        )
    }

    /// Run until cancelled or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ping = self.rx.recv() => {
                    if ping.is_none() {
                        break;
                    }
                }
            }

            let update = StateUpdate {
                last_request_unix: Some(chrono::Utc::now().timestamp()),
                ..Default::default()
            };
            match self.store.merge(&self.name, &update).await {
                Ok(()) => debug!(name = %self.name, "Wrote heartbeat"),
                Err(e) => warn!(name = %self.name, error = %e, "Failed to write heartbeat"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.window) => {}
            }
            // Activity during the window is covered by the write above
            while self.rx.try_recv().is_ok() {}
        }
        debug!("Heartbeat reporter stopped");
    }
}
