/// Message type carried by the broker
///
/// A message is built once by its publisher and then shared, read-only,
/// between every receiver of the channel it was sent on.
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Value stored in a message payload
pub type PayloadValue = Arc<dyn Any + Send + Sync>;

/// Immutable bus message
///
/// The meaning of `message_type` is defined by the channel the message is
/// sent on. Payload entries can only be added through [`Message::with`]
/// while the publisher still owns the message.
#[derive(Clone)]
pub struct Message {
    channel_name: Arc<str>,
    message_type: u32,
    payload: HashMap<String, PayloadValue>,
}

impl Message {
    /// Create an empty message for a channel
    pub fn new(channel_name: impl Into<Arc<str>>, message_type: impl Into<u32>) -> Self {
        Self {
            channel_name: channel_name.into(),
            message_type: message_type.into(),
            payload: HashMap::new(),
        }
    }

    /// Add a payload entry, replacing any previous value under `key`
    pub fn with<T>(mut self, key: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.payload.insert(key.into(), Arc::new(value));
        self
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn message_type(&self) -> u32 {
        self.message_type
    }

    /// Typed access to a payload entry
    ///
    /// Returns `None` when the key is missing or holds a value of another type.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.payload.get(key)?.downcast_ref::<T>()
    }

    /// Raw access to a payload entry
    pub fn value(&self, key: &str) -> Option<&PayloadValue> {
        self.payload.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.payload.contains_key(key)
    }

    /// Payload keys, in no particular order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.payload.keys().map(String::as_str)
    }

    /// Get a human-readable description of the message
    pub fn description(&self) -> String {
        format!("{}#{}", self.channel_name, self.message_type)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("Message")
            .field("channel_name", &self.channel_name)
            .field("message_type", &self.message_type)
            .field("payload_keys", &keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_payload_access() {
        let message = Message::new("ServerConnection", 3u32)
            .with("ServerName", "living-room".to_string())
            .with("Port", 8080u16);

        assert_eq!(message.channel_name(), "ServerConnection");
        assert_eq!(message.message_type(), 3);
        assert_eq!(
            message.get::<String>("ServerName").map(String::as_str),
            Some("living-room")
        );
        assert_eq!(message.get::<u16>("Port"), Some(&8080));
        assert!(message.contains_key("Port"));
    }

    #[test]
    fn test_message_wrong_type_or_missing_key() {
        let message = Message::new("Devices", 1u32).with("Count", 2u32);

        assert!(message.get::<u64>("Count").is_none());
        assert!(message.get::<u32>("Missing").is_none());
        assert!(message.value("Count").is_some());
    }

    #[test]
    fn test_message_with_replaces_value() {
        let message = Message::new("Devices", 1u32)
            .with("Count", 1u32)
            .with("Count", 5u32);

        assert_eq!(message.get::<u32>("Count"), Some(&5));
        assert_eq!(message.keys().count(), 1);
    }

    #[test]
    fn test_message_debug_lists_sorted_keys() {
        let message = Message::new("Devices", 7u32)
            .with("b", 1u8)
            .with("a", 2u8);

        let debug = format!("{:?}", message);
        assert!(debug.contains("Devices"));
        assert!(debug.contains("[\"a\", \"b\"]"));
        assert_eq!(message.description(), "Devices#7");
    }
}
