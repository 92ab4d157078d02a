//! JSON codec for push frames.
//!
//! Frame shapes (one JSON object per text frame, `type` discriminates):
//!
//! ```text
//! {"type":"new_confession", "confession": {...}}
//! {"type":"new_reply",      "reply": {...}}
//! {"type":"vote_update",    "confession_id": "...", "vote_type": "upvote",
//!                           "upvotes": 3, "downvotes": 1}   // tallies optional
//! {"type":"crisis_support", "resources": {...}}
//! {"type":"connection" | "pong" | "echo" | "error", ...}    // control
//! ```
//!
//! An optional top-level string (or integer) `id` labels the frame for
//! de-duplication.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{EventId, EventKind, EventPayload};

/// Why a frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unrecognized frame type `{0}`")]
    UnknownType(String),
    #[error("invalid {kind:?} payload: {reason}")]
    InvalidPayload { kind: EventKind, reason: String },
}

/// Housekeeping frames from the push endpoint. Never dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Connected { user_id: Option<String> },
    Pong,
    Echo,
    ServerError { message: String },
}

/// A successfully classified frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Event {
        id: Option<EventId>,
        payload: EventPayload,
    },
    Control(ControlFrame),
}

/// Parse and validate one text frame.
pub fn decode(text: &str) -> Result<Inbound, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(DecodeError::NotAnObject);
    };
    let frame_type = match fields.remove("type") {
        Some(Value::String(t)) => t,
        _ => return Err(DecodeError::MissingType),
    };

    let id = match fields.remove("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(EventId::new(s)),
        Some(Value::Number(n)) => Some(EventId::new(n.to_string())),
        _ => None,
    };

    let payload = match frame_type.as_str() {
        "new_confession" => EventPayload::ContentCreated(nested(
            &mut fields,
            "confession",
            EventKind::ContentCreated,
        )?),
        "new_reply" => {
            EventPayload::ReplyCreated(nested(&mut fields, "reply", EventKind::ReplyCreated)?)
        }
        "vote_update" => EventPayload::VoteChanged(
            serde_json::from_value(Value::Object(fields)).map_err(|e| {
                DecodeError::InvalidPayload {
                    kind: EventKind::VoteChanged,
                    reason: e.to_string(),
                }
            })?,
        ),
        "crisis_support" => {
            // A crisis advisory must survive a bad payload.
            let resources = match fields.remove("resources") {
                Some(raw) => serde_json::from_value(raw).unwrap_or_else(|e| {
                    log::warn!("crisis_support resources invalid ({e}); using fallback resources");
                    Default::default()
                }),
                None => Default::default(),
            };
            EventPayload::CrisisAdvisory(resources)
        }
        "connection" => {
            let user_id = fields
                .get("user_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(Inbound::Control(ControlFrame::Connected { user_id }));
        }
        "pong" => return Ok(Inbound::Control(ControlFrame::Pong)),
        "echo" => return Ok(Inbound::Control(ControlFrame::Echo)),
        "error" => {
            let message = fields
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(Inbound::Control(ControlFrame::ServerError { message }));
        }
        other => return Err(DecodeError::UnknownType(other.to_string())),
    };

    Ok(Inbound::Event { id, payload })
}

fn nested<T: serde::de::DeserializeOwned>(
    fields: &mut Map<String, Value>,
    key: &str,
    kind: EventKind,
) -> Result<T, DecodeError> {
    let raw = fields.remove(key).ok_or_else(|| DecodeError::InvalidPayload {
        kind,
        reason: format!("missing `{key}`"),
    })?;
    serde_json::from_value(raw).map_err(|e| DecodeError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

/// Render a payload as a push frame, optionally labelled with an id.
pub fn encode(payload: &EventPayload, id: Option<&EventId>) -> Result<String, serde_json::Error> {
    let mut frame = Map::new();
    frame.insert(
        "type".to_string(),
        Value::String(payload.kind().wire_type().to_string()),
    );
    if let Some(id) = id {
        frame.insert("id".to_string(), Value::String(id.to_string()));
    }
    match payload {
        EventPayload::ContentCreated(c) => {
            frame.insert("confession".to_string(), serde_json::to_value(c)?);
        }
        EventPayload::ReplyCreated(r) => {
            frame.insert("reply".to_string(), serde_json::to_value(r)?);
        }
        EventPayload::VoteChanged(v) => {
            if let Value::Object(body) = serde_json::to_value(v)? {
                frame.extend(body);
            }
        }
        EventPayload::CrisisAdvisory(res) => {
            frame.insert("resources".to_string(), serde_json::to_value(res)?);
        }
    }
    serde_json::to_string(&Value::Object(frame))
}

/// Keep-alive frame understood by the push endpoint.
pub fn ping_frame() -> String {
    r#"{"type":"ping"}"#.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ContentId;
    use crate::vote::VoteAction;

    #[test]
    fn test_decode_new_confession() {
        let text = r#"{"type":"new_confession","confession":{
            "id":"c1","tx_id":"tx1","content":"hello","author":"anon-7",
            "timestamp":"2026-03-01T10:00:00","upvotes":4,"mood":"relieved",
            "tags":["school"],"verified":true,"gateway_url":"https://gw/tx1"}}"#;
        match decode(text).unwrap() {
            Inbound::Event { id, payload: EventPayload::ContentCreated(c) } => {
                assert!(id.is_none());
                assert_eq!(c.content_id(), ContentId::new("tx1"));
                assert_eq!(c.upvotes, 4);
                assert_eq!(c.tags, vec!["school".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_vote_update_with_and_without_tallies() {
        let bare = r#"{"type":"vote_update","confession_id":"c1","vote_type":"upvote"}"#;
        match decode(bare).unwrap() {
            Inbound::Event { payload: EventPayload::VoteChanged(v), .. } => {
                assert_eq!(v.vote_type, VoteAction::Upvote);
                assert_eq!(v.aggregate(), None);
            }
            other => panic!("unexpected {other:?}"),
        }

        let tallied = r#"{"type":"vote_update","confession_id":"c1","vote_type":"downvote","upvotes":5,"downvotes":2}"#;
        match decode(tallied).unwrap() {
            Inbound::Event { payload: EventPayload::VoteChanged(v), .. } => {
                assert_eq!(v.aggregate(), Some(3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_vote_update_with_extreme_tallies() {
        let text = r#"{"type":"vote_update","confession_id":"c1","vote_type":"upvote","upvotes":-9223372036854775808,"downvotes":1}"#;
        match decode(text).unwrap() {
            Inbound::Event { payload: EventPayload::VoteChanged(v), .. } => {
                assert_eq!(v.upvotes, Some(i64::MIN));
                assert_eq!(v.aggregate(), None);
            }
            other => panic!("unexpected {other:?}"),
        }

        let wide = r#"{"type":"vote_update","confession_id":"c1","vote_type":"upvote","upvotes":9223372036854775807,"downvotes":-1}"#;
        match decode(wide).unwrap() {
            Inbound::Event { payload: EventPayload::VoteChanged(v), .. } => {
                assert_eq!(v.aggregate(), None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_frame_id() {
        let text = r#"{"type":"vote_update","id":"evt-42","confession_id":"c1","vote_type":"upvote"}"#;
        match decode(text).unwrap() {
            Inbound::Event { id, .. } => assert_eq!(id, Some(EventId::new("evt-42"))),
            other => panic!("unexpected {other:?}"),
        }
        let numeric = r#"{"type":"vote_update","id":17,"confession_id":"c1","vote_type":"upvote"}"#;
        match decode(numeric).unwrap() {
            Inbound::Event { id, .. } => assert_eq!(id, Some(EventId::new("17"))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_crisis_with_bad_resources_still_decodes() {
        let text = r#"{"type":"crisis_support","resources":"call someone"}"#;
        match decode(text).unwrap() {
            Inbound::Event { payload: EventPayload::CrisisAdvisory(res), .. } => {
                assert_eq!(res, Default::default());
            }
            other => panic!("unexpected {other:?}"),
        }
        let missing = r#"{"type":"crisis_support"}"#;
        assert!(matches!(
            decode(missing).unwrap(),
            Inbound::Event { payload: EventPayload::CrisisAdvisory(_), .. }
        ));
    }

    #[test]
    fn test_control_frames() {
        let greeting = r#"{"type":"connection","status":"connected","user_id":"0xabc"}"#;
        assert_eq!(
            decode(greeting).unwrap(),
            Inbound::Control(ControlFrame::Connected {
                user_id: Some("0xabc".into())
            })
        );
        assert_eq!(
            decode(r#"{"type":"pong","timestamp":"t"}"#).unwrap(),
            Inbound::Control(ControlFrame::Pong)
        );
        assert_eq!(
            decode(r#"{"type":"error","message":"Invalid JSON format"}"#).unwrap(),
            Inbound::Control(ControlFrame::ServerError {
                message: "Invalid JSON format".into()
            })
        );
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(decode("{not json"), Err(DecodeError::Malformed(_))));
        assert_eq!(decode("[1,2]"), Err(DecodeError::NotAnObject));
        assert_eq!(decode(r#"{"kind":"x"}"#), Err(DecodeError::MissingType));
        assert_eq!(decode(r#"{"type":7}"#), Err(DecodeError::MissingType));
        assert_eq!(
            decode(r#"{"type":"trending"}"#),
            Err(DecodeError::UnknownType("trending".into()))
        );
        assert!(matches!(
            decode(r#"{"type":"new_reply"}"#),
            Err(DecodeError::InvalidPayload { kind: EventKind::ReplyCreated, .. })
        ));
        assert!(matches!(
            decode(r#"{"type":"vote_update","confession_id":"c1","vote_type":"like"}"#),
            Err(DecodeError::InvalidPayload { kind: EventKind::VoteChanged, .. })
        ));
    }

    #[test]
    fn test_encode_is_decodable() {
        let payload = EventPayload::VoteChanged(crate::event::VoteUpdate {
            confession_id: ContentId::new("c9"),
            vote_type: VoteAction::Downvote,
            upvotes: Some(1),
            downvotes: Some(4),
        });
        let text = encode(&payload, Some(&EventId::new("x1"))).unwrap();
        assert_eq!(
            decode(&text).unwrap(),
            Inbound::Event {
                id: Some(EventId::new("x1")),
                payload
            }
        );
    }

    #[test]
    fn test_ping_frame_shape() {
        let v: Value = serde_json::from_str(&ping_frame()).unwrap();
        assert_eq!(v["type"], "ping");
    }
}
