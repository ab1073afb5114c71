//! Outbound event fan-out.
//!
//! Anything the device wants to tell the hub without being asked (preview
//! frames, recorder lifecycle, transfer results) goes through an
//! [`EventPublisher`]. Every connected hub gets its own subscriber; a slow
//! hub loses events rather than slowing down the publisher.

use serde_json::{json, Map, Value};
use tandem_types::{Event, PreviewFrame};
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Cloneable handle for publishing device events.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    device_id: String,
    tx: broadcast::Sender<Event>,
}

impl EventPublisher {
    /// Create a publisher buffering `capacity` events per subscriber.
    pub fn new(device_id: &str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            device_id: device_id.to_string(),
            tx,
        }
    }

    /// Publish an event to every connected hub.
    ///
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Publish a named event with `device_id` added to its fields.
    pub fn publish_named(&self, name: &str, fields: Value) -> usize {
        let mut payload = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        payload.insert("device_id".into(), json!(self.device_id));
        self.publish(Event {
            name: name.to_string(),
            payload,
        })
    }

    /// Publish a `preview_frame` event carrying a JPEG image.
    pub fn publish_preview(&self, jpeg: &[u8], ts: i64) -> usize {
        let frame = PreviewFrame::from_jpeg(self.device_id.as_str(), jpeg, ts);
        match Event::new(PreviewFrame::NAME, &frame) {
            Ok(event) => self.publish(event),
            Err(e) => {
                tracing::warn!("Failed to encode preview frame: {}", e);
                0
            }
        }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preview_reaches_subscribers() {
        let publisher = EventPublisher::new("dev-1", 8);
        let mut rx = publisher.subscribe();

        assert_eq!(publisher.publish_preview(b"jpeg", 10), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "preview_frame");
        let frame: PreviewFrame = event.payload_as().unwrap();
        assert_eq!(frame.device_id, "dev-1");
        assert_eq!(frame.jpeg().unwrap(), b"jpeg");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let publisher = EventPublisher::new("dev-1", 8);
        assert_eq!(publisher.publish_named("x", json!({})), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let publisher = EventPublisher::new("dev-1", 2);
        let mut rx = publisher.subscribe();
        for i in 0..5 {
            publisher.publish_named("tick", json!({ "i": i }));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload.get("i"), Some(&json!(3)));
    }
}
