//! Proxy events for presentation layers (status views, log forwarders).
//!
//! Events go out on a broadcast channel. Having no subscribers is normal and
//! sending never blocks the proxy.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProxyEvent {
    /// Emitted once per proxied request after the response body completed
    RequestCompleted {
        method: String,
        path: String,
        status: u16,
        #[serde(with = "duration_ms")]
        duration: Duration,
        input_tokens: u64,
        output_tokens: u64,
        output_tok_per_sec: f64,
    },
    /// Periodic sample while a response is streaming
    StreamingRate {
        path: String,
        output_tokens: u64,
        output_tok_per_sec: f64,
    },
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: ProxyEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
