//! NIP-01 relay protocol messages.
//!
//! Every message is a JSON array sent as a text WebSocket frame, with the
//! message type as its first element.

use nostr::Event;
use pingpong_core::ExchangeFilter;
use serde_json::{json, Value};
use thiserror::Error;

/// Maximum relay message size (1MB); exchange events are tiny.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed {0} message")]
    Malformed(&'static str),
}

/// Client to relay.
#[derive(Debug)]
pub enum ClientMessage<'a> {
    Event(&'a Event),
    Req {
        subscription_id: &'a str,
        filter: &'a ExchangeFilter,
    },
    Close(&'a str),
}

impl ClientMessage<'_> {
    pub fn to_json(&self) -> String {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filter,
            } => json!(["REQ", subscription_id, filter]),
            ClientMessage::Close(subscription_id) => json!(["CLOSE", subscription_id]),
        };
        value.to_string()
    }
}

/// Relay to client.
#[derive(Debug)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    EndOfStoredEvents(String),
    Notice(String),
    Closed {
        subscription_id: String,
        message: String,
    },
    /// A message type we don't act on (AUTH, COUNT, ...)
    Other(String),
}

fn str_at<'a>(items: &'a [Value], index: usize, kind: &'static str) -> Result<&'a str, MessageError> {
    items
        .get(index)
        .and_then(Value::as_str)
        .ok_or(MessageError::Malformed(kind))
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        let items: Vec<Value> = serde_json::from_str(text)?;
        let kind = items
            .first()
            .and_then(Value::as_str)
            .ok_or(MessageError::Malformed("relay"))?;

        match kind {
            "EVENT" => {
                let subscription_id = str_at(&items, 1, "EVENT")?.to_string();
                let raw = items.get(2).ok_or(MessageError::Malformed("EVENT"))?;
                let event: Event = serde_json::from_value(raw.clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            "OK" => Ok(RelayMessage::Ok {
                event_id: str_at(&items, 1, "OK")?.to_string(),
                accepted: items
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or(MessageError::Malformed("OK"))?,
                message: items
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "EOSE" => Ok(RelayMessage::EndOfStoredEvents(
                str_at(&items, 1, "EOSE")?.to_string(),
            )),
            "NOTICE" => Ok(RelayMessage::Notice(str_at(&items, 1, "NOTICE")?.to_string())),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: str_at(&items, 1, "CLOSED")?.to_string(),
                message: items
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Ok(RelayMessage::Other(other.to_string())),
        }
    }
}
