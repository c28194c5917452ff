//! Topic-keyed publish/subscribe for detection events.
//!
//! Rule engines and other in-process consumers subscribe to a topic
//! (`motion.start`, `motion.end`, `recording.start`, `recording.end`) and
//! never call into a camera pipeline directly.

use chrono::{DateTime, Utc};
use common::{DetectionEvent, EventKind};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 128;

pub const TOPICS: [&str; 4] = ["motion.start", "motion.end", "recording.start", "recording.end"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusMessage {
    pub topic: &'static str,
    pub camera_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roi_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<&DetectionEvent> for BusMessage {
    fn from(event: &DetectionEvent) -> Self {
        Self {
            topic: event.kind.topic(),
            camera_id: event.camera_id.clone(),
            roi_id: event.roi_id.clone(),
            timestamp: event.timestamp,
        }
    }
}

pub struct EventBus {
    capacity: usize,
    topics: Mutex<HashMap<&'static str, broadcast::Sender<BusMessage>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<BusMessage> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(kind.topic())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to the message's topic. Returns the number of subscribers
    /// that received it.
    pub fn publish(&self, message: BusMessage) -> usize {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = topics.get(message.topic) else {
            trace!(topic = message.topic, "no subscribers");
            return 0;
        };
        sender.send(message).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &'static str, roi: &str) -> BusMessage {
        BusMessage {
            topic,
            camera_id: "cam-1".to_string(),
            roi_id: Some(roi.to_string()),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_only_see_their_topic() {
        let bus = EventBus::default();
        let mut starts = bus.subscribe(EventKind::MotionStart);
        let mut ends = bus.subscribe(EventKind::MotionEnd);

        assert_eq!(bus.publish(message("motion.start", "door")), 1);
        assert_eq!(bus.publish(message("motion.end", "door")), 1);

        let got = starts.recv().await.unwrap();
        assert_eq!(got.topic, "motion.start");
        assert_eq!(got.roi_id.as_deref(), Some("door"));
        assert!(starts.try_recv().is_err());

        assert_eq!(ends.recv().await.unwrap().topic, "motion.end");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(message("recording.start", "x")), 0);
    }

    #[test]
    fn test_topics_match_event_kinds() {
        let kinds = [
            EventKind::MotionStart,
            EventKind::MotionEnd,
            EventKind::RecordingStart,
            EventKind::RecordingEnd,
        ];
        for (kind, topic) in kinds.iter().zip(TOPICS) {
            assert_eq!(kind.topic(), topic);
        }
    }
}
