//! Hand-off of violations and lifecycle events to the push service.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::config::Config;
use crate::ws::ServerEvent;

/// Receives events that should reach members who are not connected.
///
/// `dispatch` is called on the request path and must not block.
pub trait PushNotifier: Send + Sync {
    fn dispatch(&self, event: &ServerEvent);
}

/// Push disabled.
pub struct NoopNotifier;

impl PushNotifier for NoopNotifier {
    fn dispatch(&self, event: &ServerEvent) {
        tracing::trace!(kind = event.kind(), "Push disabled, event not forwarded");
    }
}

/// POSTs each event as JSON to a webhook. Delivery is fire-and-forget; a
/// failure is logged and never reaches the caller.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl PushNotifier for WebhookNotifier {
    fn dispatch(&self, event: &ServerEvent) {
        if !event.is_pushable() {
            return;
        }
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(kind = event.kind(), error = %e, "Failed to encode push payload");
                return;
            }
        };
        let client = self.client.clone();
        let url = self.url.clone();
        let kind = event.kind();
        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(kind, "Push event delivered");
                }
                Ok(resp) => {
                    tracing::warn!(kind, status = %resp.status(), "Push webhook rejected event");
                }
                Err(e) => {
                    tracing::warn!(kind, error = %e, "Push webhook unreachable");
                }
            }
        });
    }
}

/// Keeps pushed payloads in memory, for embedding and tests.
#[derive(Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<Value>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Value> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PushNotifier for MemoryNotifier {
    fn dispatch(&self, event: &ServerEvent) {
        if !event.is_pushable() {
            return;
        }
        if let Ok(payload) = serde_json::to_value(event) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(payload);
        }
    }
}

pub fn from_config(config: &Config) -> Arc<dyn PushNotifier> {
    match &config.push_webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "Push notifications go to webhook");
            Arc::new(WebhookNotifier::new(url.clone()))
        }
        None => Arc::new(NoopNotifier),
    }
}
