//! Wire frames exchanged with clients and the envelope carried by the fabric.
//!
//! Inbound frames are JSON objects discriminated by `type`. Known tags are
//! decoded into typed variants; any other tag is an opaque signal and is kept
//! as the raw JSON object so it can be relayed byte-for-byte in meaning.

use parley_types::{ConnectionId, PresenceStatus, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const CHAT_MESSAGE: &str = "chat_message";
const REACTION: &str = "reaction";
const TYPING: &str = "typing";
const PRESENCE_PROBE: &str = "presence_probe";
const CALL_USER: &str = "call_user";

/// Why an inbound frame was refused. The connection stays open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("frame is not valid JSON: {0}")]
    Json(String),
    #[error("frame must be a JSON object")]
    NotAnObject,
    #[error("frame type must be a string")]
    InvalidType,
    #[error("invalid {kind} frame: {reason}")]
    InvalidField { kind: String, reason: String },
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("{0} frames are reserved for the server")]
    Reserved(String),
    #[error("binary frames are not supported")]
    Binary,
    #[error("{0} frames require a room connection")]
    NotInRoom(String),
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    ChatMessage { message: String },
    Reaction { message_id: i64, emoji: String },
    Typing { is_typing: bool },
    Signal(Signal),
}

/// An opaque signaling frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// The frame's `type` tag.
    pub kind: String,
    /// The client object exactly as received.
    pub payload: Value,
    /// Present when the signal asks to ring another user.
    pub call: Option<CallRequest>,
}

/// The cross-channel part of a `call_user` signal.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub target: UserId,
    pub signal_data: Value,
}

#[derive(Deserialize)]
struct ChatMessageFields {
    message: String,
}

#[derive(Deserialize)]
struct ReactionFields {
    message_id: i64,
    emoji: String,
}

#[derive(Deserialize)]
struct TypingFields {
    is_typing: bool,
}

fn invalid(kind: &str, reason: impl Into<String>) -> ProtocolViolation {
    ProtocolViolation::InvalidField {
        kind: kind.to_string(),
        reason: reason.into(),
    }
}

fn fields<'a, T: Deserialize<'a>>(kind: &str, value: &'a Value) -> Result<T, ProtocolViolation> {
    T::deserialize(value).map_err(|e| invalid(kind, e.to_string()))
}

/// Decodes one inbound text frame.
///
/// A frame without `type` is a chat message, which is what the browser
/// client sends.
///
/// # Errors
///
/// Returns a [`ProtocolViolation`] for anything that cannot be dispatched.
pub fn decode(text: &str, max_len: usize) -> Result<InboundFrame, ProtocolViolation> {
    if text.len() > max_len {
        return Err(ProtocolViolation::TooLarge {
            len: text.len(),
            max: max_len,
        });
    }

    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolViolation::Json(e.to_string()))?;
    let Value::Object(map) = &value else {
        return Err(ProtocolViolation::NotAnObject);
    };
    let kind = match map.get("type") {
        None => CHAT_MESSAGE.to_string(),
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(ProtocolViolation::InvalidType),
    };

    match kind.as_str() {
        CHAT_MESSAGE => {
            let f: ChatMessageFields = fields(&kind, &value)?;
            if f.message.trim().is_empty() {
                return Err(invalid(&kind, "message must not be empty"));
            }
            Ok(InboundFrame::ChatMessage { message: f.message })
        }
        REACTION => {
            let f: ReactionFields = fields(&kind, &value)?;
            if f.emoji.is_empty() {
                return Err(invalid(&kind, "emoji must not be empty"));
            }
            Ok(InboundFrame::Reaction {
                message_id: f.message_id,
                emoji: f.emoji,
            })
        }
        TYPING => {
            let f: TypingFields = fields(&kind, &value)?;
            Ok(InboundFrame::Typing {
                is_typing: f.is_typing,
            })
        }
        PRESENCE_PROBE => Err(ProtocolViolation::Reserved(kind)),
        CALL_USER => {
            let target = call_target(map.get("userToCall"))?;
            let signal_data = map.get("signalData").cloned().unwrap_or(Value::Null);
            Ok(InboundFrame::Signal(Signal {
                kind,
                payload: value,
                call: Some(CallRequest {
                    target,
                    signal_data,
                }),
            }))
        }
        _ => Ok(InboundFrame::Signal(Signal {
            kind,
            payload: value,
            call: None,
        })),
    }
}

/// `userToCall` arrives as a string from some clients and a number from others.
fn call_target(raw: Option<&Value>) -> Result<UserId, ProtocolViolation> {
    let parsed = match raw {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_i64().and_then(|id| UserId::try_from(id).ok()),
        _ => None,
    };
    parsed.ok_or_else(|| invalid(CALL_USER, "userToCall must be a positive user id"))
}

/// A chat message as delivered to room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Store id, or `None` when the write failed.
    pub id: Option<i64>,
    pub message: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub timestamp: String,
    pub persisted: bool,
}

/// Client-facing error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ProtocolViolation,
    PersistenceFailure,
    NotInRoom,
}

/// Every event the gateway can fan out or send back to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    ChatMessage(ChatEvent),
    Reaction {
        message_id: i64,
        emoji: String,
        sender_id: UserId,
    },
    Typing {
        is_typing: bool,
        sender_id: UserId,
    },
    Presence {
        user_id: UserId,
        status: PresenceStatus,
    },
    /// Asks every other member of a room to re-announce themselves.
    /// Consumed by the receiving gateway, never written to a socket.
    PresenceProbe,
    /// Opaque client signal; written to sockets as the bare payload.
    Signal {
        payload: Value,
    },
    IncomingCall {
        from: UserId,
        from_username: String,
        #[serde(rename = "signalData")]
        signal_data: Value,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl OutboundFrame {
    /// The text written to a client socket, or `None` for internal frames.
    pub fn client_text(&self) -> Result<Option<String>, serde_json::Error> {
        match self {
            Self::PresenceProbe => Ok(None),
            Self::Signal { payload } => serde_json::to_string(payload).map(Some),
            other => serde_json::to_string(other).map(Some),
        }
    }
}

/// What travels through the fabric: a frame plus its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin_user: UserId,
    pub origin_connection: ConnectionId,
    /// Drop at every connection owned by `origin_user`.
    pub self_exclude: bool,
    /// The origin connection already wrote this frame to its own socket.
    #[serde(default)]
    pub echoed_by_origin: bool,
    pub frame: OutboundFrame,
}

impl Envelope {
    /// Whether `connection`, owned by `user`, should receive this event.
    pub fn delivers_to(&self, user: UserId, connection: ConnectionId) -> bool {
        if self.echoed_by_origin && self.origin_connection == connection {
            return false;
        }
        !(self.self_exclude && self.origin_user == user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MAX: usize = 1024;

    #[test]
    fn untagged_frame_is_a_chat_message() {
        assert_eq!(
            decode(r#"{"message":"hello"}"#, MAX),
            Ok(InboundFrame::ChatMessage {
                message: "hello".to_string()
            })
        );
    }

    #[test]
    fn typed_frames_decode() {
        assert_eq!(
            decode(r#"{"type":"reaction","message_id":5,"emoji":"👍"}"#, MAX),
            Ok(InboundFrame::Reaction {
                message_id: 5,
                emoji: "👍".to_string()
            })
        );
        assert_eq!(
            decode(r#"{"type":"typing","is_typing":true}"#, MAX),
            Ok(InboundFrame::Typing { is_typing: true })
        );
    }

    #[test]
    fn malformed_frames_are_violations() {
        assert!(matches!(
            decode("{not json", MAX),
            Err(ProtocolViolation::Json(_))
        ));
        assert_eq!(decode("[1,2]", MAX), Err(ProtocolViolation::NotAnObject));
        assert_eq!(
            decode(r#"{"type":7}"#, MAX),
            Err(ProtocolViolation::InvalidType)
        );
        assert!(matches!(
            decode(r#"{"type":"chat_message"}"#, MAX),
            Err(ProtocolViolation::InvalidField { .. })
        ));
        assert!(matches!(
            decode(r#"{"message":"   "}"#, MAX),
            Err(ProtocolViolation::InvalidField { .. })
        ));
        assert!(matches!(
            decode(r#"{"type":"reaction","message_id":"x","emoji":"a"}"#, MAX),
            Err(ProtocolViolation::InvalidField { .. })
        ));
        assert!(matches!(
            decode(r#"{"type":"typing"}"#, MAX),
            Err(ProtocolViolation::InvalidField { .. })
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_before_parsing() {
        let text = format!(r#"{{"message":"{}"}}"#, "x".repeat(64));
        assert!(matches!(
            decode(&text, 16),
            Err(ProtocolViolation::TooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn clients_cannot_send_probes() {
        assert_eq!(
            decode(r#"{"type":"presence_probe"}"#, MAX),
            Err(ProtocolViolation::Reserved("presence_probe".to_string()))
        );
    }

    #[test]
    fn unknown_tag_is_an_opaque_signal() {
        let text = r#"{"type":"webrtc_offer","sdp":"v=0","nested":{"a":[1,2]}}"#;
        let InboundFrame::Signal(signal) = decode(text, MAX).unwrap() else {
            panic!("expected a signal");
        };
        assert_eq!(signal.kind, "webrtc_offer");
        assert_eq!(signal.call, None);
        assert_eq!(
            signal.payload,
            json!({"type":"webrtc_offer","sdp":"v=0","nested":{"a":[1,2]}})
        );
    }

    #[test]
    fn call_user_accepts_string_or_number_target() {
        for text in [
            r#"{"type":"call_user","userToCall":"12","signalData":{"sdp":"x"}}"#,
            r#"{"type":"call_user","userToCall":12,"signalData":{"sdp":"x"}}"#,
        ] {
            let InboundFrame::Signal(signal) = decode(text, MAX).unwrap() else {
                panic!("expected a signal");
            };
            let call = signal.call.expect("call_user carries a call request");
            assert_eq!(call.target, UserId(12));
            assert_eq!(call.signal_data, json!({"sdp":"x"}));
        }
    }

    #[test]
    fn call_user_without_target_is_a_violation() {
        for text in [
            r#"{"type":"call_user"}"#,
            r#"{"type":"call_user","userToCall":"bob"}"#,
            r#"{"type":"call_user","userToCall":-1}"#,
        ] {
            assert!(
                matches!(
                    decode(text, MAX),
                    Err(ProtocolViolation::InvalidField { .. })
                ),
                "{text} should be rejected"
            );
        }
    }

    #[test]
    fn outbound_frames_carry_type_tags() {
        let chat = OutboundFrame::ChatMessage(ChatEvent {
            id: None,
            message: "hi".to_string(),
            sender_id: UserId(1),
            receiver_id: UserId(2),
            timestamp: "2024-01-01T00:00:00.000000Z".to_string(),
            persisted: false,
        });
        let value: Value = serde_json::from_str(&chat.client_text().unwrap().unwrap()).unwrap();
        assert_eq!(value["type"], "chat_message");
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["persisted"], false);
        assert_eq!(value["sender_id"], 1);

        let call = OutboundFrame::IncomingCall {
            from: UserId(1),
            from_username: "alice".to_string(),
            signal_data: json!({"sdp":"x"}),
        };
        let value: Value = serde_json::from_str(&call.client_text().unwrap().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type":"incoming_call","from":1,"from_username":"alice","signalData":{"sdp":"x"}})
        );

        let error = OutboundFrame::Error {
            code: ErrorCode::NotInRoom,
            message: "no room".to_string(),
        };
        let value: Value = serde_json::from_str(&error.client_text().unwrap().unwrap()).unwrap();
        assert_eq!(value["code"], "not_in_room");
    }

    #[test]
    fn signals_are_written_verbatim_and_probes_not_at_all() {
        let payload = json!({"type":"ice_candidate","candidate":"abc"});
        let frame = OutboundFrame::Signal {
            payload: payload.clone(),
        };
        let text = frame.client_text().unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), payload);

        assert_eq!(OutboundFrame::PresenceProbe.client_text().unwrap(), None);
    }

    #[test]
    fn envelope_survives_the_fabric_encoding() {
        let envelope = Envelope {
            origin_user: UserId(1),
            origin_connection: ConnectionId::new(),
            self_exclude: true,
            echoed_by_origin: false,
            frame: OutboundFrame::Signal {
                payload: json!({"type":"offer","sdp":"v=0"}),
            },
        };
        let text = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn self_exclusion_is_per_user() {
        let envelope = Envelope {
            origin_user: UserId(1),
            origin_connection: ConnectionId::new(),
            self_exclude: true,
            echoed_by_origin: false,
            frame: OutboundFrame::Typing {
                is_typing: true,
                sender_id: UserId(1),
            },
        };
        let other = ConnectionId::new();
        assert!(!envelope.delivers_to(UserId(1), other));
        assert!(envelope.delivers_to(UserId(2), other));

        let shared = Envelope {
            self_exclude: false,
            echoed_by_origin: false,
            ..envelope
        };
        assert!(shared.delivers_to(UserId(1), other));
    }

    #[test]
    fn echoed_event_skips_only_the_origin_connection() {
        let origin = ConnectionId::new();
        let sibling = ConnectionId::new();
        let envelope = Envelope {
            origin_user: UserId(1),
            origin_connection: origin,
            self_exclude: false,
            echoed_by_origin: true,
            frame: OutboundFrame::Typing {
                is_typing: false,
                sender_id: UserId(1),
            },
        };
        assert!(!envelope.delivers_to(UserId(1), origin));
        assert!(envelope.delivers_to(UserId(1), sibling));
        assert!(envelope.delivers_to(UserId(2), ConnectionId::new()));
    }

    #[test]
    fn envelope_without_echo_flag_still_decodes() {
        let envelope = Envelope {
            origin_user: UserId(4),
            origin_connection: ConnectionId::new(),
            self_exclude: true,
            echoed_by_origin: false,
            frame: OutboundFrame::Typing {
                is_typing: true,
                sender_id: UserId(4),
            },
        };
        let mut value = serde_json::to_value(&envelope).unwrap();
        value.as_object_mut().unwrap().remove("echoed_by_origin");
        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }
}
