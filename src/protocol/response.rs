use std::collections::{HashMap, hash_map};

use serde_json::Value;

use super::Payload;

/// Key under which a handler's return value is sent.
pub const DATA_KEY: &str = "data";

/// Key under which a handler failure is sent.
pub const ERROR_KEY: &str = "error";

/// Every message of one transaction, keyed by message key. A key sent twice keeps the last
/// value.
#[derive(Debug, Default)]
pub struct Response {
    messages: HashMap<String, Payload>,
}

impl Response {
    pub(crate) fn insert(&mut self, key: String, value: Payload) {
        self.messages.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.messages.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Payload> {
        self.messages.remove(key)
    }

    /// The JSON value under [`DATA_KEY`], if the handler returned one.
    pub fn data(&self) -> Option<&Value> {
        self.get(DATA_KEY).and_then(Payload::as_data)
    }

    /// The error-shaped message under [`ERROR_KEY`], if the handler failed.
    pub fn error(&self) -> Option<&Value> {
        self.get(ERROR_KEY)
            .and_then(Payload::as_data)
            .filter(|value| value.get("isError").and_then(Value::as_bool) == Some(true))
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.messages.keys().map(String::as_str)
    }

    pub fn into_inner(self) -> HashMap<String, Payload> {
        self.messages
    }
}

impl IntoIterator for Response {
    type Item = (String, Payload);
    type IntoIter = hash_map::IntoIter<String, Payload>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn last_write_wins() {
        let mut response = Response::default();
        response.insert("data".into(), json!(1).into());
        response.insert("data".into(), json!(2).into());

        assert_eq!(response.len(), 1);
        assert_eq!(response.data(), Some(&json!(2)));
        assert!(!response.is_error());
    }

    #[test]
    fn error_needs_flag() {
        let mut response = Response::default();
        response.insert("error".into(), json!({"message": "nope"}).into());
        assert!(!response.is_error());

        response.insert("error".into(), json!({"isError": true, "message": "nope"}).into());
        assert_eq!(response.error().unwrap()["message"], "nope");
    }
}
