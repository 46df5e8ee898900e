//! Best-effort usage telemetry.
//!
//! Events are dropped, never awaited: `capture` pushes onto a bounded channel
//! and returns immediately, a background task posts batches of one to the
//! configured endpoint, and every failure mode (full channel, network error,
//! non-2xx) is swallowed with at most a debug log. Telemetry must never slow
//! down or fail a command.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::TelemetryConfig;

const QUEUE_DEPTH: usize = 256;
const POST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct Event {
    event: String,
    properties: Value,
    hostname: Option<String>,
    client_version: &'static str,
}

/// Handle for emitting events. Cloneable; a disabled reporter is a no-op
/// with no background task at all.
#[derive(Debug, Clone)]
pub struct Telemetry {
    tx: Option<mpsc::Sender<Event>>,
}

impl Telemetry {
    /// No-op reporter.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn new(config: &TelemetryConfig) -> Self {
        let endpoint = match (&config.enabled, &config.endpoint) {
            (true, Some(endpoint)) => endpoint.clone(),
            _ => return Self::disabled(),
        };

        let (tx, mut rx) = mpsc::channel::<Event>(QUEUE_DEPTH);
        tokio::spawn(async move {
            let client = match reqwest::Client::builder().timeout(POST_TIMEOUT).build() {
                Ok(client) => client,
                Err(e) => {
                    tracing::debug!(error = %e, "telemetry client unavailable, dropping events");
                    while rx.recv().await.is_some() {}
                    return;
                }
            };
            while let Some(event) = rx.recv().await {
                match client.post(&endpoint).json(&event).send().await {
                    Ok(resp) if !resp.status().is_success() => {
                        tracing::debug!(status = %resp.status(), "telemetry endpoint rejected event");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "telemetry post failed");
                    }
                }
            }
        });
        Self { tx: Some(tx) }
    }

    /// Queue an event. Never blocks; a full queue drops the event.
    pub fn capture(&self, event: &str, properties: Value) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = Event {
            event: event.to_string(),
            properties,
            hostname: hostname::get().ok().map(|h| h.to_string_lossy().into_owned()),
            client_version: env!("CARGO_PKG_VERSION"),
        };
        if tx.try_send(event).is_err() {
            tracing::debug!("telemetry queue full, dropping event");
        }
    }
}
