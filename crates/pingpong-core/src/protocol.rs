//! Ping/pong event conventions.
//!
//! Both directions share one event shape: a fixed application kind, an `s`
//! topic tag and a `p` tag naming the recipient. Only the content differs.

use nostr::{
    Alphabet, Event, EventBuilder, Kind, PublicKey, SingleLetterTag, Tag, TagKind, Timestamp,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::Identity;

/// Application event kind shared by pings and pongs.
pub const PINGPONG_KIND: u16 = 1573;

/// Value of the `s` topic tag.
pub const TOPIC: &str = "pingpong";

const TOPIC_TAG: &str = "s";
const RECIPIENT_TAG: &str = "p";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to sign event: {0}")]
    Sign(String),
}

/// Content marker carried by an exchange event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    Ping,
    Pong,
}

impl Payload {
    pub fn as_str(&self) -> &'static str {
        match self {
            Payload::Ping => "ping",
            Payload::Pong => "pong",
        }
    }

    /// Parse event content. Anything other than the two literal markers is `None`.
    pub fn from_content(content: &str) -> Option<Self> {
        match content {
            "ping" => Some(Payload::Ping),
            "pong" => Some(Payload::Pong),
            _ => None,
        }
    }

    pub fn of(event: &Event) -> Option<Self> {
        Self::from_content(&event.content)
    }
}

fn topic_tag() -> Tag {
    Tag::custom(
        TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::S)),
        [TOPIC],
    )
}

/// Build and sign an exchange event addressed to `recipient`.
pub fn build_message(
    identity: &Identity,
    recipient: &PublicKey,
    payload: Payload,
) -> Result<Event, ProtocolError> {
    EventBuilder::new(Kind::from(PINGPONG_KIND), payload.as_str())
        .tags([topic_tag(), Tag::public_key(*recipient)])
        .sign_with_keys(identity.keys())
        .map_err(|e| ProtocolError::Sign(e.to_string()))
}

/// The key named by the event's first `p` tag.
pub fn recipient(event: &Event) -> Option<PublicKey> {
    event.tags.iter().find_map(|tag| match tag.as_slice() {
        [name, value, ..] if name == RECIPIENT_TAG => PublicKey::from_hex(value).ok(),
        _ => None,
    })
}

fn has_tag(event: &Event, name: &str, values: &[String]) -> bool {
    event.tags.iter().any(|tag| match tag.as_slice() {
        [tag_name, value, ..] => tag_name == name && values.iter().any(|v| v == value),
        _ => false,
    })
}

/// Subscription filter for exchange events addressed to one identity.
///
/// Serializes as a NIP-01 filter object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeFilter {
    pub kinds: Vec<u16>,
    pub since: u64,
    #[serde(rename = "#p")]
    pub recipients: Vec<String>,
    #[serde(rename = "#s")]
    pub topics: Vec<String>,
}

impl ExchangeFilter {
    /// Exchange events tagged for `recipient` created at or after `since`.
    pub fn addressed_to(recipient: &PublicKey, since: Timestamp) -> Self {
        Self {
            kinds: vec![PINGPONG_KIND],
            since: since.as_u64(),
            recipients: vec![recipient.to_hex()],
            topics: vec![TOPIC.to_string()],
        }
    }

    pub fn since(&self) -> Timestamp {
        Timestamp::from(self.since)
    }

    /// Whether a relay should deliver `event` to this filter.
    pub fn matches(&self, event: &Event) -> bool {
        self.kinds.contains(&event.kind.as_u16())
            && event.created_at.as_u64() >= self.since
            && has_tag(event, RECIPIENT_TAG, &self.recipients)
            && has_tag(event, TOPIC_TAG, &self.topics)
    }
}
