//! Relay wire frames.
//!
//! Every frame is a JSON array whose first element is a string tag.

use crate::error::{ClientError, Result};
use nostr::{Event, Filter};
use serde_json::{Value, json};

/// Relay message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event(String, Event),
    /// Event id, accepted flag, reason (empty when the relay sent none).
    Ok(String, bool, String),
    Eose(String),
    Notice(String),
    Auth(String),
}

/// Message sent from the client to a relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
    Event(Event),
    Auth(Event),
}

impl ClientMessage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Req { .. } => "REQ",
            Self::Close(_) => "CLOSE",
            Self::Event(_) => "EVENT",
            Self::Auth(_) => "AUTH",
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(json!("REQ"));
                frame.push(json!(subscription_id));
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            Self::Close(subscription_id) => json!(["CLOSE", subscription_id]),
            Self::Event(event) => json!(["EVENT", event]),
            Self::Auth(event) => json!(["AUTH", event]),
        };
        Ok(value)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }
}

/// Parse relay protocol JSON text message into typed relay message.
///
/// Unknown tags and empty arrays yield `Ok(None)` so frames from protocol
/// extensions can be ignored.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let array = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
    if array.is_empty() {
        return Ok(None);
    }

    let kind = array[0]
        .as_str()
        .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

    match kind {
        "EVENT" => {
            if array.len() < 3 {
                return Err(ClientError::Protocol("invalid EVENT message".to_string()));
            }
            let subscription_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid EVENT subscription id".to_string()))?
                .to_string();
            let event: Event = serde_json::from_value(array[2].clone()).map_err(|error| {
                ClientError::Protocol(format!("invalid EVENT payload: {}", error))
            })?;
            Ok(Some(RelayMessage::Event(subscription_id, event)))
        }
        "OK" => {
            if array.len() < 3 {
                return Err(ClientError::Protocol("invalid OK message".to_string()));
            }
            let event_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid OK event id".to_string()))?
                .to_string();
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
            let reason = match array.get(3) {
                None | Some(Value::Null) => String::new(),
                Some(reason) => reason
                    .as_str()
                    .ok_or_else(|| ClientError::Protocol("invalid OK message text".to_string()))?
                    .to_string(),
            };
            Ok(Some(RelayMessage::Ok(event_id, accepted, reason)))
        }
        "EOSE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid EOSE message".to_string()));
            }
            let subscription_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid EOSE subscription id".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Eose(subscription_id)))
        }
        "NOTICE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid NOTICE message".to_string()));
            }
            let message = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid NOTICE message text".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Notice(message)))
        }
        "AUTH" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid AUTH message".to_string()));
            }
            let challenge = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid AUTH challenge".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Auth(challenge)))
        }
        _ => Ok(None),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Subscription id of an `EVENT` frame, read without parsing.
///
/// Only looks at the head of the frame; `None` means the scan could not tell.
pub fn subscription_id_hint(text: &str) -> Option<&str> {
    const TAG: &[u8] = b"\"EVENT\"";
    let bytes = text.as_bytes();

    let tag_at = find(&bytes[..bytes.len().min(22)], TAG)?;
    let after_tag = tag_at + TAG.len();
    let start = after_tag + bytes.get(after_tag..)?.iter().position(|&b| b == b'"')?;
    let window_end = bytes.len().min(80);
    if start + 1 >= window_end {
        return None;
    }
    let end = start + 1 + bytes[start + 1..window_end].iter().position(|&b| b == b'"')?;
    text.get(start + 1..end)
}

/// Event id of an `EVENT` frame, read without parsing.
///
/// Takes the first `"id":` key in the frame, so a relay that orders keys
/// differently can make this return the wrong value. Callers must treat the
/// result as a hint.
pub fn event_id_hint(text: &str) -> Option<&str> {
    const KEY: &[u8] = b"\"id\":";
    let bytes = text.as_bytes();

    let key_at = find(bytes, KEY)?;
    let after_key = key_at + KEY.len();
    let quote = after_key + bytes.get(after_key..)?.iter().position(|&b| b == b'"')?;
    let candidate = text.get(quote + 1..quote + 65)?;
    candidate
        .bytes()
        .all(|byte| byte.is_ascii_hexdigit())
        .then_some(candidate)
}
