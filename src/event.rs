//! Events and the wire envelope that carries them between nodes

use std::fmt;

use serde::{Deserialize, Serialize};

/// A typed field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// UTF-8 string
    Str(String),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Boolean
    Bool(bool),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// String content, if this is a string field
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an integer field
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_owned())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}

/// A keyed event: an ordered list of named fields plus the key used for routing.
///
/// Events are immutable once built; use [`Event::builder`] to construct one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    key: Vec<u8>,
    fields: Vec<(String, FieldValue)>,
}

impl Event {
    /// Start building an event routed by `key`
    pub fn builder(key: impl Into<Vec<u8>>) -> EventBuilder {
        EventBuilder {
            key: key.into(),
            fields: Vec::new(),
        }
    }

    /// Routing key
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Routing key as text, if it is valid UTF-8
    pub fn key_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.key).ok()
    }

    /// Look up a field by name
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Look up a string field by name
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_str)
    }

    /// Look up an integer field by name
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(FieldValue::as_int)
    }

    /// Fields in insertion order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the event has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Builder for [`Event`]
#[derive(Debug, Clone)]
pub struct EventBuilder {
    key: Vec<u8>,
    fields: Vec<(String, FieldValue)>,
}

impl EventBuilder {
    /// Set a field. Setting an existing name replaces its value in place.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(field, _)| *field == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    /// Finish the event
    pub fn build(self) -> Event {
        Event {
            key: self.key,
            fields: self.fields,
        }
    }
}

/// Wire envelope for one event addressed to a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Partition the event was routed to
    pub target_partition: u32,

    /// Stream the event belongs to
    pub stream_name: String,

    /// Codec-encoded [`Event`]
    pub payload: Vec<u8>,
}

impl EventMessage {
    /// Create a new envelope
    pub fn new(target_partition: u32, stream_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            target_partition,
            stream_name: stream_name.into(),
            payload,
        }
    }
}

impl fmt::Display for EventMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({} bytes)",
            self.stream_name,
            self.target_partition,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_keeps_order_and_replaces() {
        let event = Event::builder("user-1")
            .field("name", "ada")
            .field("visits", 3i64)
            .field("name", "grace")
            .build();

        let names: Vec<&str> = event.fields().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["name", "visits"]);
        assert_eq!(event.get_str("name"), Some("grace"));
        assert_eq!(event.get_int("visits"), Some(3));
        assert_eq!(event.key_str(), Some("user-1"));
    }

    #[test]
    fn test_missing_and_mistyped_fields() {
        let event = Event::builder("k").field("n", 1i64).build();
        assert!(event.get("absent").is_none());
        assert!(event.get_str("n").is_none());
    }
}
