//! Bounded, newest-first store of recently received messages

use super::qos::QoS;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Default number of records kept per session
pub const DEFAULT_BUFFER_CAPACITY: usize = 50;

/// One message delivered by the broker. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub topic: String,
    pub payload: Bytes,
    /// Payload decoded as UTF-8, `None` when the bytes are not valid UTF-8
    pub text: Option<String>,
    pub message_id: u16,
    pub qos: QoS,
    pub received_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Build a record stamped with the current time
    pub fn new(topic: impl Into<String>, payload: Bytes, qos: QoS, message_id: u16) -> Self {
        Self::received_at(topic, payload, qos, message_id, Utc::now())
    }

    pub fn received_at(
        topic: impl Into<String>,
        payload: Bytes,
        qos: QoS,
        message_id: u16,
        received_at: DateTime<Utc>,
    ) -> Self {
        let text = std::str::from_utf8(&payload).ok().map(str::to_owned);
        Self {
            topic: topic.into(),
            payload,
            text,
            message_id,
            qos,
            received_at,
        }
    }
}

/// Capacity-bounded message list. Index 0 is always the newest record.
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    records: VecDeque<MessageRecord>,
    capacity: usize,
}

impl MessageBuffer {
    /// A zero capacity is raised to one so the newest record is always retained.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn insert(&mut self, record: MessageRecord) {
        self.records.push_front(record);
        // Evict from the tail until we fit
        while self.records.len() > self.capacity {
            self.records.pop_back();
        }
    }

    /// Records whose topic equals `topic` exactly, newest first. No wildcard matching.
    pub fn list_for_topic(&self, topic: &str) -> Vec<MessageRecord> {
        self.records
            .iter()
            .filter(|record| record.topic == topic)
            .cloned()
            .collect()
    }

    /// Snapshot of every record, newest first
    pub fn list(&self) -> Vec<MessageRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn newest(&self) -> Option<&MessageRecord> {
        self.records.front()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, body: &'static str) -> MessageRecord {
        MessageRecord::new(topic, Bytes::from_static(body.as_bytes()), QoS::AtMostOnce, 0)
    }

    fn bodies(buffer: &MessageBuffer) -> Vec<String> {
        buffer
            .list()
            .into_iter()
            .map(|r| r.text.unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_insert_evicts_oldest_when_full() {
        let mut buffer = MessageBuffer::with_capacity(3);
        for body in ["A", "B", "C", "D"] {
            buffer.insert(record("t", body));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(bodies(&buffer), vec!["D", "C", "B"]);
    }

    #[test]
    fn test_newest_is_last_inserted() {
        let mut buffer = MessageBuffer::default();
        buffer.insert(record("a", "first"));
        buffer.insert(record("b", "second"));

        assert_eq!(buffer.newest().unwrap().topic, "b");
        assert_eq!(buffer.capacity(), DEFAULT_BUFFER_CAPACITY);
    }

    #[test]
    fn test_list_for_topic_is_exact_match() {
        let mut buffer = MessageBuffer::default();
        buffer.insert(record("sensors/1", "x"));
        buffer.insert(record("sensors/2", "y"));
        buffer.insert(record("sensors/1", "z"));

        let matches = buffer.list_for_topic("sensors/1");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].text.as_deref(), Some("z"));
        assert_eq!(matches[1].text.as_deref(), Some("x"));

        // Wildcards are not expanded here
        assert!(buffer.list_for_topic("sensors/#").is_empty());
        assert!(buffer.list_for_topic("sensors/+").is_empty());
    }

    #[test]
    fn test_clear_empties_buffer() {
        let mut buffer = MessageBuffer::with_capacity(5);
        buffer.insert(record("t", "a"));
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.newest().is_none());
    }

    #[test]
    fn test_zero_capacity_keeps_newest() {
        let mut buffer = MessageBuffer::with_capacity(0);
        buffer.insert(record("t", "a"));
        buffer.insert(record("t", "b"));
        assert_eq!(buffer.len(), 1);
        assert_eq!(bodies(&buffer), vec!["b"]);
    }

    #[test]
    fn test_non_utf8_payload_has_no_text() {
        let rec = MessageRecord::new("bin", Bytes::from_static(&[0xff, 0xfe, 0x00]), QoS::ExactlyOnce, 7);
        assert!(rec.text.is_none());
        assert_eq!(rec.payload.len(), 3);
        assert_eq!(rec.message_id, 7);
    }
}
