//! Message protocol: the immutable `Message` record, its
//! canonical JSON encoding, structural validation, and the forwarding
//! transformation.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::error::MessageError;
use crate::sanitizer::Sanitizer;

/// One of the five message kinds on the wire. Unknown values
/// decode to `Broadcast` for tolerant parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Broadcast,
    Heartbeat,
    Ack,
    Discovery,
    System,
}

impl MessageType {
    /// Tolerant parse: any string not matching a known variant becomes
    /// `Broadcast` rather than a parse failure.
    pub fn from_str_tolerant(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "heartbeat" => MessageType::Heartbeat,
            "ack" => MessageType::Ack,
            "discovery" => MessageType::Discovery,
            "system" => MessageType::System,
            _ => MessageType::Broadcast,
        }
    }
}

/// An immutable broadcast record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub sender_id: String,
    pub content: String,
    pub timestamp: f64,
    pub ttl: u8,
    pub seen_by: Vec<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

/// Intermediate form used only to tolerate unknown `type` strings on parse;
/// the wire format itself is unchanged.
#[derive(Deserialize)]
struct RawMessage {
    message_id: String,
    sender_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    timestamp: f64,
    #[serde(default)]
    ttl: u8,
    #[serde(default)]
    seen_by: Vec<String>,
    #[serde(rename = "type", default)]
    message_type: String,
    #[serde(default)]
    sender_name: Option<String>,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl Message {
    /// `encoded_size(m)`: the UTF-8 byte length of the canonical JSON form.
    pub fn encoded_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    /// `age_seconds(now)`, used by the router's TTL/expiry bookkeeping.
    pub fn age_seconds(&self, now: f64) -> f64 {
        (now - self.timestamp).max(0.0)
    }

    /// `parse(bytes) -> Message`: UTF-8 decode, JSON decode,
    /// field coercion with defaults, then structural validation.
    pub fn parse(bytes: &[u8], config: &Config, sanitizer: &Sanitizer) -> Result<Message, MessageError> {
        let text =
            std::str::from_utf8(bytes).map_err(|e| MessageError::ParseError(format!("invalid utf-8: {e}")))?;

        let raw: RawMessage =
            serde_json::from_str(text).map_err(|e| MessageError::ParseError(format!("invalid json: {e}")))?;

        let msg = Message {
            message_id: raw.message_id,
            sender_id: raw.sender_id,
            content: raw.content,
            timestamp: if raw.timestamp > 0.0 { raw.timestamp } else { now_secs() },
            ttl: raw.ttl,
            seen_by: dedup_preserve_order(raw.seen_by),
            message_type: MessageType::from_str_tolerant(&raw.message_type),
            sender_name: raw.sender_name,
        };

        validate_structure(&msg, config, sanitizer)?;
        Ok(msg)
    }

    /// `create_broadcast(content, sender_id, sender_name?)`
    pub fn create_broadcast(
        content: &str,
        sender_id: &str,
        sender_name: Option<&str>,
        config: &Config,
        sanitizer: &Sanitizer,
    ) -> Result<Message, MessageError> {
        let sanitized_content = if config.enable_input_sanitization {
            sanitizer.sanitize(content, config.max_content_length)
        } else {
            content.to_string()
        };
        sanitizer
            .validate(&sanitized_content, config)
            .map_err(MessageError::ValidationError)?;

        let sanitized_name = sender_name.map(|n| sanitizer.sanitize_device_name(n));

        let msg = Message {
            message_id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            content: sanitized_content,
            timestamp: now_secs(),
            ttl: config.message_ttl,
            seen_by: vec![sender_id.to_string()],
            message_type: MessageType::Broadcast,
            sender_name: sanitized_name,
        };

        let size = msg.encoded_size();
        if size > config.max_message_size {
            return Err(MessageError::SizeError { actual: size, limit: config.max_message_size });
        }
        Ok(msg)
    }

    /// `prepare_for_forwarding(m, forwarder_id) -> Option<Message>`
    pub fn prepare_for_forwarding(&self, forwarder_id: &str) -> Option<Message> {
        if self.ttl == 0 {
            return None;
        }
        let mut seen_by = self.seen_by.clone();
        if !seen_by.iter().any(|id| id == forwarder_id) {
            seen_by.push(forwarder_id.to_string());
        }
        Some(Message {
            ttl: self.ttl - 1,
            seen_by,
            ..self.clone()
        })
    }

    /// Canonical encoding used for every BLE write/notify.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Message always serializes")
    }
}

fn dedup_preserve_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

fn is_uuid_shaped(s: &str) -> bool {
    Uuid::parse_str(s).is_ok()
}

fn validate_structure(msg: &Message, config: &Config, sanitizer: &Sanitizer) -> Result<(), MessageError> {
    if !is_uuid_shaped(&msg.message_id) {
        return Err(MessageError::ValidationError("message_id is not UUID-shaped".to_string()));
    }
    if msg.sender_id.is_empty() {
        return Err(MessageError::ValidationError("sender_id is empty".to_string()));
    }
    if !msg.seen_by.iter().any(|id| id == &msg.sender_id) {
        return Err(MessageError::ValidationError("sender_id not present in seen_by".to_string()));
    }
    if msg.ttl > config.message_ttl {
        return Err(MessageError::ValidationError("ttl exceeds MESSAGE_TTL".to_string()));
    }

    let now = now_secs();
    if msg.timestamp > now + 60.0 {
        return Err(MessageError::ValidationError("timestamp too far in the future".to_string()));
    }

    let size = msg.encoded_size();
    if size > config.max_message_size {
        return Err(MessageError::SizeError { actual: size, limit: config.max_message_size });
    }

    if msg.message_type == MessageType::Broadcast {
        sanitizer.validate(&msg.content, config).map_err(MessageError::ValidationError)?;
    }

    Ok(())
}
