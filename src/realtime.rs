//! Activity events for the realtime channel.
//!
//! This crate only produces events. Delivery to sockets happens elsewhere;
//! [`ChannelNotifier`] hands events to whatever subscribes to its broadcast
//! channel.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    /// App namespace (its api path), empty for platform-wide events.
    pub namespace: String,
    pub path: String,
    pub verb: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub is_super: bool,
    pub broadcast: bool,
    pub params: Value,
}

impl ActivityEvent {
    pub fn new(namespace: impl Into<String>, path: impl Into<String>, verb: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            path: path.into(),
            verb: verb.into(),
            role: None,
            is_super: false,
            broadcast: false,
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    pub fn for_super(mut self) -> Self {
        self.is_super = true;
        self
    }

    pub fn for_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Fire-and-forget sink for activity events.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: ActivityEvent);
}

/// Fans events into a broadcast channel. Events sent while nobody listens
/// are dropped.
#[derive(Clone)]
pub struct ChannelNotifier {
    sender: broadcast::Sender<ActivityEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.sender.subscribe()
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: ActivityEvent) {
        let path = event.path.clone();
        if self.sender.send(event).is_err() {
            debug!(path = %path, "No realtime subscribers");
        }
    }
}

/// Records events in the log only.
#[derive(Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: ActivityEvent) {
        info!(
            namespace = %event.namespace,
            path = %event.path,
            verb = %event.verb,
            broadcast = event.broadcast,
            "Activity"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_delivers_to_subscribers() {
        let notifier = ChannelNotifier::new(8);
        notifier.notify(ActivityEvent::new("acme", "dropped", "put"));

        let mut rx = notifier.subscribe();
        notifier.notify(
            ActivityEvent::new("acme", "app-schema:updated", "put")
                .with_params(json!({"appId": "1"}))
                .broadcast(),
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, "app-schema:updated");
        assert!(event.broadcast);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "namespace": "acme",
                "path": "app-schema:updated",
                "verb": "put",
                "isSuper": false,
                "broadcast": true,
                "params": {"appId": "1"}
            })
        );
    }
}
