//! Playback-engine wire protocol
//!
//! Message envelope is JSON with one of `command` / `event` / `type` naming
//! the message. Replies and pushes use camelCase field names; `bpm` on the
//! wire is `tempo` in the store.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// One of the two engine deck slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Deck {
    A,
    B,
}

impl Deck {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" | "a" => Some(Deck::A),
            "B" | "b" => Some(Deck::B),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Deck::A => "A",
            Deck::B => "B",
        }
    }
}

/// Parsed inbound engine message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    GetTrackInfo {
        track_id: Uuid,
        deck: Option<Deck>,
        stems: bool,
        request_id: Option<String>,
    },
    SetCue {
        deck: Deck,
        index: i64,
        position: f64,
    },
    TrackLoadRequested {
        deck: Deck,
        track_id: Uuid,
    },
    TrackLoaded {
        deck: Deck,
        track_id: Uuid,
        success: bool,
    },
    CuePointSet {
        deck: Deck,
        index: i64,
        position: f64,
        success: bool,
    },
    CuePointRemoved {
        deck: Deck,
        index: i64,
        success: bool,
    },
    /// Ack for our identification message
    Welcome { version: Option<String> },
    /// Engine-side deck snapshot; tracked locally, so ignored
    DeckStateUpdate,
    /// Anything else; logged and dropped
    Unknown(String),
}

fn field_uuid(v: &Value, name: &str) -> Option<Uuid> {
    v.get(name)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn field_deck(v: &Value) -> Option<Deck> {
    v.get("deck").and_then(Value::as_str).and_then(Deck::parse)
}

impl InboundMessage {
    /// Parse an envelope; None when the JSON is so malformed that even the
    /// discriminator is missing.
    pub fn parse(v: &Value) -> Option<Self> {
        if let Some(command) = v.get("command").and_then(Value::as_str) {
            return Some(match command {
                "getTrackInfo" => InboundMessage::GetTrackInfo {
                    track_id: field_uuid(v, "trackId")?,
                    deck: field_deck(v),
                    stems: v.get("stems").and_then(Value::as_bool).unwrap_or(false),
                    request_id: v
                        .get("requestId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                },
                "deck.setCue" => InboundMessage::SetCue {
                    deck: field_deck(v)?,
                    index: v.get("index").and_then(Value::as_i64)?,
                    position: v.get("position").and_then(Value::as_f64)?,
                },
                other => InboundMessage::Unknown(other.to_string()),
            });
        }

        if let Some(event) = v.get("event").and_then(Value::as_str) {
            return Some(match event {
                "trackLoadRequested" => InboundMessage::TrackLoadRequested {
                    deck: field_deck(v)?,
                    track_id: field_uuid(v, "trackId")?,
                },
                "trackLoaded" => InboundMessage::TrackLoaded {
                    deck: field_deck(v)?,
                    track_id: field_uuid(v, "trackId")?,
                    success: v.get("success").and_then(Value::as_bool).unwrap_or(true),
                },
                "cuePointSet" => InboundMessage::CuePointSet {
                    deck: field_deck(v)?,
                    index: v.get("index").and_then(Value::as_i64)?,
                    position: v.get("position").and_then(Value::as_f64)?,
                    success: v.get("success").and_then(Value::as_bool).unwrap_or(true),
                },
                "cuePointRemoved" => InboundMessage::CuePointRemoved {
                    deck: field_deck(v)?,
                    index: v.get("index").and_then(Value::as_i64)?,
                    success: v.get("success").and_then(Value::as_bool).unwrap_or(true),
                },
                "deckStateUpdate" => InboundMessage::DeckStateUpdate,
                other => InboundMessage::Unknown(other.to_string()),
            });
        }

        if let Some(kind) = v.get("type").and_then(Value::as_str) {
            return Some(match kind {
                "welcome" => InboundMessage::Welcome {
                    version: v
                        .get("version")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                },
                other => InboundMessage::Unknown(other.to_string()),
            });
        }

        None
    }
}

/// Hot cue entry in a track-info reply
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HotCuePayload {
    pub index: i64,
    pub position: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// `getTrackInfo` reply / `sendTrackInfo` push
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfoReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub track_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_beat_offset: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_phrase_beat_no: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hot_cues: Option<Vec<HotCuePayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrackInfoReply {
    pub fn error(track_id: Uuid, request_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            request_id,
            track_id,
            file_path: None,
            bpm: None,
            key: None,
            mode: None,
            first_beat_offset: None,
            first_phrase_beat_no: None,
            hot_cues: None,
            error: Some(error.into()),
        }
    }
}

/// `stemsReady` push
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StemsReadyPush {
    pub success: bool,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub track_id: Uuid,
    pub stems: HashMap<String, PathBuf>,
}

/// Identification sent immediately after connect
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifyMessage {
    pub command: String,
    pub client: String,
    pub version: String,
}

impl IdentifyMessage {
    pub fn new() -> Self {
        Self {
            command: "appServerIdentify".to_string(),
            client: "mixd-cp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for IdentifyMessage {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the control plane sends to the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Identify(IdentifyMessage),
    TrackInfo(TrackInfoReply),
    StemsReady(StemsReadyPush),
}

impl OutboundMessage {
    pub fn stems_ready(
        track_id: Uuid,
        request_id: Option<String>,
        stems: HashMap<String, PathBuf>,
    ) -> Self {
        OutboundMessage::StemsReady(StemsReadyPush {
            success: true,
            kind: "stemsReady".to_string(),
            request_id,
            track_id,
            stems,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_get_track_info_command() {
        let id = Uuid::new_v4();
        let msg = InboundMessage::parse(&json!({
            "command": "getTrackInfo",
            "trackId": id.to_string(),
            "deck": "A",
            "stems": true,
            "requestId": "r1",
        }))
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::GetTrackInfo {
                track_id: id,
                deck: Some(Deck::A),
                stems: true,
                request_id: Some("r1".to_string()),
            }
        );
    }

    #[test]
    fn parses_cue_events() {
        let id = Uuid::new_v4();
        let msg = InboundMessage::parse(&json!({
            "event": "trackLoadRequested",
            "deck": "B",
            "trackId": id.to_string(),
        }))
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::TrackLoadRequested {
                deck: Deck::B,
                track_id: id
            }
        );

        let msg = InboundMessage::parse(&json!({
            "event": "cuePointSet",
            "deck": "B",
            "index": 3,
            "position": 42.75,
            "success": true,
        }))
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::CuePointSet {
                deck: Deck::B,
                index: 3,
                position: 42.75,
                success: true
            }
        );
    }

    #[test]
    fn deck_state_update_is_recognized_and_ignored() {
        let msg = InboundMessage::parse(&json!({"event": "deckStateUpdate", "decks": {}})).unwrap();
        assert_eq!(msg, InboundMessage::DeckStateUpdate);
    }

    #[test]
    fn unknown_commands_do_not_fail_parsing() {
        let msg = InboundMessage::parse(&json!({"command": "doBackflip"})).unwrap();
        assert_eq!(msg, InboundMessage::Unknown("doBackflip".to_string()));
        assert!(InboundMessage::parse(&json!({"unrelated": 1})).is_none());
    }

    #[test]
    fn track_info_reply_serializes_camel_case() {
        let id = Uuid::new_v4();
        let reply = TrackInfoReply {
            success: true,
            request_id: Some("r2".to_string()),
            track_id: id,
            file_path: Some("/music/a.flac".to_string()),
            bpm: Some(128.0),
            key: Some(5),
            mode: Some(1),
            first_beat_offset: Some(0.468),
            first_phrase_beat_no: Some(1),
            hot_cues: Some(vec![]),
            error: None,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["requestId"], "r2");
        assert_eq!(json["firstBeatOffset"], 0.468);
        assert_eq!(json["bpm"], 128.0);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn stems_ready_carries_type_tag() {
        let push = OutboundMessage::stems_ready(Uuid::new_v4(), Some("r3".into()), HashMap::new());
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json["type"], "stemsReady");
        assert_eq!(json["success"], true);
    }
}
