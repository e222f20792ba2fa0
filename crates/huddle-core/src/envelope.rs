//! JSON envelopes exchanged with the signaling relay.
//!
//! Every frame is a self-describing object tagged by `type`. The relay
//! broadcasts frames to the whole room, so directed kinds (`offer`, `answer`,
//! `ice-candidate`) carry a `targetUserId` the receiver must check itself.
//!
//! Unknown types are logged and dropped; a known type with missing fields is
//! an [`EnvelopeError`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::EnvelopeError;

/// Identity of a call participant. The relay and browsers may send ids as
/// strings or integers; both decode to the same string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => PeerId(text),
            RawId::Signed(value) => PeerId(value.to_string()),
            RawId::Unsigned(value) => PeerId(value.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// `RTCSessionDescriptionInit` shape: `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Envelope {
    Join {
        user_id: PeerId,
        username: String,
    },
    #[serde(rename = "users")]
    UsersSnapshot {
        #[serde(default)]
        users: Vec<Value>,
    },
    Message {
        user_id: PeerId,
        username: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
    },
    Typing {
        user_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        is_typing: bool,
    },
    JoinCall {
        user_id: PeerId,
        username: String,
    },
    LeaveCall {
        user_id: PeerId,
    },
    UserLeft {
        user_id: PeerId,
    },
    UserJoin {
        user_id: PeerId,
        username: String,
    },
    History {
        #[serde(default)]
        messages: Vec<Value>,
    },
    Offer {
        user_id: PeerId,
        target_user_id: PeerId,
        sdp: SessionDescription,
    },
    Answer {
        user_id: PeerId,
        target_user_id: PeerId,
        sdp: SessionDescription,
    },
    IceCandidate {
        user_id: PeerId,
        target_user_id: PeerId,
        candidate: IceCandidate,
    },
}

const KNOWN_KINDS: &[&str] = &[
    "join",
    "users",
    "message",
    "typing",
    "join-call",
    "leave-call",
    "user-left",
    "user-join",
    "history",
    "offer",
    "answer",
    "ice-candidate",
];

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Join { .. } => "join",
            Envelope::UsersSnapshot { .. } => "users",
            Envelope::Message { .. } => "message",
            Envelope::Typing { .. } => "typing",
            Envelope::JoinCall { .. } => "join-call",
            Envelope::LeaveCall { .. } => "leave-call",
            Envelope::UserLeft { .. } => "user-left",
            Envelope::UserJoin { .. } => "user-join",
            Envelope::History { .. } => "history",
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::IceCandidate { .. } => "ice-candidate",
        }
    }

    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            Envelope::Join { user_id, .. }
            | Envelope::Message { user_id, .. }
            | Envelope::Typing { user_id, .. }
            | Envelope::JoinCall { user_id, .. }
            | Envelope::LeaveCall { user_id }
            | Envelope::UserLeft { user_id }
            | Envelope::UserJoin { user_id, .. }
            | Envelope::Offer { user_id, .. }
            | Envelope::Answer { user_id, .. }
            | Envelope::IceCandidate { user_id, .. } => Some(user_id),
            Envelope::UsersSnapshot { .. } | Envelope::History { .. } => None,
        }
    }

    /// Addressee of a directed envelope; `None` for broadcast kinds.
    pub fn target(&self) -> Option<&PeerId> {
        match self {
            Envelope::Offer { target_user_id, .. }
            | Envelope::Answer { target_user_id, .. }
            | Envelope::IceCandidate { target_user_id, .. } => Some(target_user_id),
            _ => None,
        }
    }

    pub fn is_directed(&self) -> bool {
        self.target().is_some()
    }
}

pub fn decode(text: &str) -> Result<Option<Envelope>, EnvelopeError> {
    let value: Value = serde_json::from_str(text).map_err(EnvelopeError::Json)?;
    decode_value(value)
}

pub fn decode_value(value: Value) -> Result<Option<Envelope>, EnvelopeError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::MissingType)?
        .to_owned();
    if !KNOWN_KINDS.contains(&kind.as_str()) {
        tracing::debug!(target = "huddle::envelope", kind = %kind, "dropping unknown envelope type");
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|source| EnvelopeError::Malformed { kind, source })?;

    let empty_sender = envelope.sender().is_some_and(|id| id.as_str().is_empty());
    let empty_target = envelope.target().is_some_and(|id| id.as_str().is_empty());
    if empty_sender || empty_target {
        return Err(EnvelopeError::EmptyIdentity {
            kind: envelope.kind(),
        });
    }
    Ok(Some(envelope))
}

pub fn encode(envelope: &Envelope) -> Result<String, EnvelopeError> {
    serde_json::to_string(envelope).map_err(EnvelopeError::Encode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_and_string_ids_decode_to_same_peer() {
        let numeric = decode(r#"{"type":"leave-call","userId":42}"#)
            .unwrap()
            .unwrap();
        let text = decode(r#"{"type":"leave-call","userId":"42"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(numeric, text);
        assert_eq!(numeric.sender(), Some(&PeerId::from("42")));
    }

    #[test]
    fn offer_uses_browser_field_names() {
        let raw = json!({
            "type": "offer",
            "userId": "a",
            "targetUserId": "b",
            "sdp": { "type": "offer", "sdp": "v=0" }
        });
        let envelope = decode_value(raw.clone()).unwrap().unwrap();
        assert_eq!(envelope.target(), Some(&PeerId::from("b")));
        assert!(envelope.is_directed());

        let encoded: Value = serde_json::from_str(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(encoded, raw);
    }

    #[test]
    fn ice_candidate_keeps_optional_fields() {
        let envelope = decode(
            r#"{"type":"ice-candidate","userId":1,"targetUserId":2,
                "candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host",
                             "sdpMid":"0","sdpMLineIndex":0,"usernameFragment":null}}"#,
        )
        .unwrap()
        .unwrap();
        match envelope {
            Envelope::IceCandidate { candidate, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn typing_flag_is_camel_case() {
        let envelope = Envelope::Typing {
            user_id: "u".into(),
            username: None,
            is_typing: true,
        };
        let encoded: Value = serde_json::from_str(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(encoded, json!({"type": "typing", "userId": "u", "isTyping": true}));
    }

    #[test]
    fn unknown_type_is_dropped_not_rejected() {
        assert!(decode(r#"{"type":"presence","userId":"a"}"#).unwrap().is_none());
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let err = decode(r#"{"type":"answer","userId":"a"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed { ref kind, .. } if kind == "answer"));
    }

    #[test]
    fn missing_type_is_rejected() {
        assert!(matches!(
            decode(r#"{"userId":"a"}"#),
            Err(EnvelopeError::MissingType)
        ));
    }

    #[test]
    fn empty_sender_is_rejected() {
        let err = decode(r#"{"type":"join-call","userId":"","username":"x"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptyIdentity { kind: "join-call" }));
    }

    #[test]
    fn users_snapshot_has_no_sender() {
        let envelope = decode(r#"{"type":"users","users":[{"userId":"a"}]}"#)
            .unwrap()
            .unwrap();
        assert!(envelope.sender().is_none());
        assert_eq!(envelope.kind(), "users");
    }
}
