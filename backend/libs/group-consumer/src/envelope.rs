//! Delivered record representation

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A key/value pair carried in a record's headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: Bytes,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One delivered record.
///
/// Envelopes are immutable once built; cloning is cheap because key, value
/// and header payloads are reference-counted `Bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Bytes>,
    value: Bytes,
    headers: Vec<Header>,
    timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: value.into(),
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// First header value stored under `key`, if any.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|header| header.key == key)
            .map(|header| header.value.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_accessors() {
        let envelope = Envelope::new("orders", 3, 42, &b"{\"id\":\"o-1\"}"[..])
            .with_key(&b"o-1"[..])
            .with_headers(vec![
                Header::new("event_type", &b"order.created"[..]),
                Header::new("event_type", &b"shadowed"[..]),
            ]);

        assert_eq!(envelope.topic(), "orders");
        assert_eq!(envelope.partition(), 3);
        assert_eq!(envelope.offset(), 42);
        assert_eq!(envelope.key(), Some(&b"o-1"[..]));
        assert_eq!(envelope.header("event_type"), Some(&b"order.created"[..]));
        assert_eq!(envelope.header("missing"), None);
        assert!(envelope.timestamp().is_none());
    }
}
