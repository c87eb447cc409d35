//! Wire envelopes for the delivery pipeline.
//!
//! `PushMessage` is the fan-out envelope carried between Send and the
//! gateways; `ClientMessage` is the per-recipient envelope written to the
//! client socket. Both decoders accept snake_case and the CamelCase field
//! spellings used by older peers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved id for synthetic server-originated envelopes (greetings,
/// offline batches, info notices). Generated message ids are strictly
/// positive, so negative ids never collide with real traffic.
pub const SYNTHETIC_MSG_ID: i64 = -1;

/// Envelope type tag for chat messages.
pub const MSG_TYPE_CHAT: &str = "chat";
/// Envelope type tag for delivery acknowledgements back to the sender.
pub const MSG_TYPE_ACK: &str = "ack";
/// Envelope type tag for server-originated notices.
pub const MSG_TYPE_SYSTEM: &str = "system";
/// Envelope type tag for batched offline replays.
pub const MSG_TYPE_BATCH: &str = "batch";
/// Envelope type tag for degraded-mode notices (e.g. offline messages
/// exist but could not be fetched).
pub const MSG_TYPE_INFO: &str = "info";

/// Fan-out envelope: one message addressed to N recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(alias = "ID")]
    pub id: i64,
    #[serde(rename = "type", alias = "Type")]
    pub msg_type: String,
    #[serde(alias = "RoomID")]
    pub room_id: i64,
    #[serde(alias = "SenderID")]
    pub sender_id: i64,
    #[serde(alias = "TargetIDs")]
    pub target_ids: Vec<i64>,
    #[serde(alias = "Payload")]
    pub payload: Value,
}

/// Per-recipient envelope delivered on the client link. Same shape as
/// [`PushMessage`] minus the target list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(alias = "ID")]
    pub id: i64,
    #[serde(rename = "type", alias = "Type")]
    pub msg_type: String,
    #[serde(alias = "RoomID")]
    pub room_id: i64,
    #[serde(alias = "SenderID")]
    pub sender_id: i64,
    #[serde(alias = "Payload")]
    pub payload: Value,
}

impl ClientMessage {
    /// Build an acknowledgement envelope for a fully settled message.
    pub fn ack(msg_id: i64) -> Self {
        Self {
            id: msg_id,
            msg_type: MSG_TYPE_ACK.to_string(),
            room_id: 0,
            sender_id: 0,
            payload: Value::Null,
        }
    }

    /// Build a synthetic server-originated envelope with the reserved id.
    pub fn synthetic(msg_type: &str, payload: Value) -> Self {
        Self {
            id: SYNTHETIC_MSG_ID,
            msg_type: msg_type.to_string(),
            room_id: SYNTHETIC_MSG_ID,
            sender_id: SYNTHETIC_MSG_ID,
            payload,
        }
    }

    /// Whether this envelope carries a generated message id, as opposed to
    /// a reserved synthetic one.
    pub fn has_tracked_id(&self) -> bool {
        self.id > 0
    }
}

impl From<&PushMessage> for ClientMessage {
    fn from(msg: &PushMessage) -> Self {
        Self {
            id: msg.id,
            msg_type: msg.msg_type.clone(),
            room_id: msg.room_id,
            sender_id: msg.sender_id,
            payload: msg.payload.clone(),
        }
    }
}

impl PushMessage {
    /// Re-address this envelope to a subset of its targets.
    pub fn with_targets(&self, target_ids: Vec<i64>) -> Self {
        Self {
            id: self.id,
            msg_type: self.msg_type.clone(),
            room_id: self.room_id,
            sender_id: self.sender_id,
            target_ids,
            payload: self.payload.clone(),
        }
    }
}

/// Chat content variants, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatPayload {
    Text {
        text: String,
    },
    Image {
        url: String,
        width: u32,
        height: u32,
    },
    Voice {
        url: String,
        /// Clip length in seconds.
        duration: u32,
    },
    File {
        url: String,
        file_name: String,
        /// Size in bytes.
        size: i64,
    },
}

impl ChatPayload {
    /// Decode a payload from raw content JSON.
    ///
    /// Two-pass: first extract the `type` tag, then parse the
    /// variant-specific body, so an unknown tag and a malformed body
    /// report distinct errors.
    pub fn from_value(content: &Value) -> Result<Self, PayloadError> {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(rename = "type")]
            tag: String,
        }
        let probe: Probe = serde_json::from_value(content.clone())
            .map_err(|e| PayloadError::MissingTag(e.to_string()))?;
        match probe.tag.as_str() {
            "text" | "image" | "voice" | "file" => serde_json::from_value(content.clone())
                .map_err(|e| PayloadError::BadBody(probe.tag.clone(), e.to_string())),
            other => Err(PayloadError::UnknownTag(other.to_string())),
        }
    }

    /// The discriminant tag for this variant.
    pub fn tag(&self) -> &'static str {
        match self {
            ChatPayload::Text { .. } => "text",
            ChatPayload::Image { .. } => "image",
            ChatPayload::Voice { .. } => "voice",
            ChatPayload::File { .. } => "file",
        }
    }
}

/// Content decode failures, surfaced to the sender as invalid content.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("content has no usable type tag: {0}")]
    MissingTag(String),
    #[error("unknown content type: {0}")]
    UnknownTag(String),
    #[error("invalid {0} payload: {1}")]
    BadBody(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_round_trips_all_variants() {
        let variants = vec![
            ChatPayload::Text { text: "hi".into() },
            ChatPayload::Image {
                url: "https://cdn/x.png".into(),
                width: 640,
                height: 480,
            },
            ChatPayload::Voice {
                url: "https://cdn/x.ogg".into(),
                duration: 12,
            },
            ChatPayload::File {
                url: "https://cdn/x.pdf".into(),
                file_name: "x.pdf".into(),
                size: 1024,
            },
        ];
        for payload in variants {
            let value = serde_json::to_value(&payload).unwrap();
            let back = ChatPayload::from_value(&value).unwrap();
            assert_eq!(payload, back);
        }
    }

    #[test]
    fn payload_rejects_unknown_tag() {
        let err = ChatPayload::from_value(&json!({"type": "sticker", "id": 7})).unwrap_err();
        assert!(matches!(err, PayloadError::UnknownTag(t) if t == "sticker"));
    }

    #[test]
    fn payload_rejects_malformed_body() {
        let err = ChatPayload::from_value(&json!({"type": "image", "url": "x"})).unwrap_err();
        assert!(matches!(err, PayloadError::BadBody(t, _) if t == "image"));
    }

    #[test]
    fn client_message_accepts_both_spellings() {
        let snake = json!({
            "id": 42, "type": "chat", "room_id": 7, "sender_id": 1,
            "payload": {"type": "text", "text": "hi"}
        });
        let camel = json!({
            "ID": 42, "Type": "chat", "RoomID": 7, "SenderID": 1,
            "Payload": {"type": "text", "text": "hi"}
        });
        let a: ClientMessage = serde_json::from_value(snake).unwrap();
        let b: ClientMessage = serde_json::from_value(camel).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.msg_type, b.msg_type);
        assert_eq!(a.room_id, b.room_id);
        assert_eq!(a.sender_id, b.sender_id);
    }

    #[test]
    fn push_message_narrows_to_client_message() {
        let push = PushMessage {
            id: 9,
            msg_type: MSG_TYPE_CHAT.into(),
            room_id: 3,
            sender_id: 1,
            target_ids: vec![2, 4],
            payload: json!({"type": "text", "text": "hello"}),
        };
        let client = ClientMessage::from(&push);
        let value = serde_json::to_value(&client).unwrap();
        assert!(value.get("target_ids").is_none());
        assert_eq!(value["type"], "chat");
        assert_eq!(value["id"], 9);
    }

    #[test]
    fn ack_envelope_carries_only_id_and_tag() {
        let value = serde_json::to_value(ClientMessage::ack(310)).unwrap();
        assert_eq!(value["id"], 310);
        assert_eq!(value["type"], "ack");
        assert!(value["payload"].is_null());
    }

    #[test]
    fn synthetic_ids_stay_reserved() {
        let greeting = ClientMessage::synthetic(MSG_TYPE_SYSTEM, json!("connected"));
        assert_eq!(greeting.id, SYNTHETIC_MSG_ID);
        assert!(!greeting.has_tracked_id());
        assert!(ClientMessage::ack(77).has_tracked_id());
    }
}
