//! Channel message vocabulary
//!
//! Every message on the real-time channel is a JSON text frame of the form
//! `{"event": <name>, "data": {...}}`. Handshake payloads use the same
//! shapes browsers use for session descriptions and ICE candidates so the
//! server can forward them untouched.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::turn::{RosterEntry, TeamId, TurnContext};
use crate::voice::{AudioFormat, AudioFrame};

/// Messages exchanged over the real-time channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ChannelMessage {
    /// Link handshake start
    Offer(OfferMessage),
    /// Link handshake completion
    Answer(AnswerMessage),
    /// Incremental connectivity info
    Candidate(CandidateMessage),
    /// Relayed voice frame (relay strategy only)
    AudioFrame(RelayedFrame),
    /// A participant joined or left the room
    Membership(MembershipUpdate),
    /// Full roster snapshot
    RoomUpdate(RoomSnapshot),
    /// Turn snapshot
    TurnUpdate(TurnContext),
    /// Join a room (sent after every connect)
    JoinRoom(RoomJoin),
    /// Leave a room (sent on orderly shutdown)
    LeaveRoom(RoomJoin),
}

impl ChannelMessage {
    /// Event name, for logging
    pub fn event_name(&self) -> &'static str {
        match self {
            ChannelMessage::Offer(_) => "offer",
            ChannelMessage::Answer(_) => "answer",
            ChannelMessage::Candidate(_) => "candidate",
            ChannelMessage::AudioFrame(_) => "audioFrame",
            ChannelMessage::Membership(_) => "membership",
            ChannelMessage::RoomUpdate(_) => "roomUpdate",
            ChannelMessage::TurnUpdate(_) => "turnUpdate",
            ChannelMessage::JoinRoom(_) => "joinRoom",
            ChannelMessage::LeaveRoom(_) => "leaveRoom",
        }
    }

    /// Parse a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description (`{type, sdp}`)
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

/// Connectivity candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferMessage {
    pub offer: SessionDescription,
    pub from_identity: String,
    pub to_identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerMessage {
    pub answer: SessionDescription,
    pub from_identity: String,
    pub to_identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateMessage {
    pub candidate: IceCandidate,
    pub from_identity: String,
    pub to_identity: String,
}

/// Voice frame carried through the channel (payload is base64)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedFrame {
    pub sender_identity: String,
    pub payload: String,
    pub format: AudioFormat,
    pub sequence: u32,
    pub timestamp: u32,
}

impl RelayedFrame {
    pub fn from_frame(frame: &AudioFrame) -> Self {
        Self {
            sender_identity: frame.sender_identity().to_string(),
            payload: BASE64.encode(frame.payload()),
            format: frame.format(),
            sequence: frame.sequence(),
            timestamp: frame.timestamp(),
        }
    }

    /// Decode back into a frame. Returns `None` if the payload is not valid base64.
    pub fn into_frame(self) -> Option<AudioFrame> {
        let payload = BASE64.decode(self.payload.as_bytes()).ok()?;
        Some(AudioFrame::new(
            self.sender_identity,
            self.sequence,
            self.timestamp,
            payload,
            self.format,
        ))
    }
}

/// Membership change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipChange {
    Joined,
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipUpdate {
    pub identity: String,
    pub change: MembershipChange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub participants: Vec<RosterEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoin {
    pub room_id: String,
    pub identity: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::CodecKind;

    #[test]
    fn test_offer_wire_shape() {
        let msg = ChannelMessage::Offer(OfferMessage {
            offer: SessionDescription::offer("v=0"),
            from_identity: "ali".to_string(),
            to_identity: "veli".to_string(),
        });
        let value: serde_json::Value =
            serde_json::from_str(&msg.to_json().expect("serialize")).expect("parse");

        assert_eq!(value["event"], "offer");
        assert_eq!(value["data"]["offer"]["type"], "offer");
        assert_eq!(value["data"]["offer"]["sdp"], "v=0");
        assert_eq!(value["data"]["fromIdentity"], "ali");
        assert_eq!(value["data"]["toIdentity"], "veli");
    }

    #[test]
    fn test_candidate_browser_shape() {
        let text = r#"{"event":"candidate","data":{"candidate":{"candidate":"candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"},"fromIdentity":"veli","toIdentity":"ali"}}"#;
        let msg = ChannelMessage::from_json(text).expect("deserialize");
        let ChannelMessage::Candidate(c) = msg else {
            panic!("expected candidate");
        };
        assert_eq!(c.candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.candidate.sdp_m_line_index, Some(0));
        assert_eq!(c.candidate.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_candidate_optional_fields_omitted() {
        let json = serde_json::to_string(&IceCandidate::new("candidate:x")).expect("serialize");
        assert_eq!(json, r#"{"candidate":"candidate:x"}"#);
    }

    #[test]
    fn test_relayed_frame_payload_base64() {
        let frame = AudioFrame::new(
            "ali",
            7,
            2880,
            vec![0xDE, 0xAD, 0xBE, 0xEF],
            AudioFormat::voice(CodecKind::Pcm16),
        );
        let relayed = RelayedFrame::from_frame(&frame);
        assert_eq!(relayed.payload, "3q2+7w==");
        assert_eq!(relayed.into_frame(), Some(frame));
    }

    #[test]
    fn test_relayed_frame_bad_base64() {
        let relayed = RelayedFrame {
            sender_identity: "ali".to_string(),
            payload: "not base64!".to_string(),
            format: AudioFormat::voice(CodecKind::Opus),
            sequence: 0,
            timestamp: 0,
        };
        assert!(relayed.into_frame().is_none());
    }

    #[test]
    fn test_membership_and_room_update() {
        let msg = ChannelMessage::from_json(
            r#"{"event":"membership","data":{"identity":"ayse","change":"left"}}"#,
        )
        .expect("deserialize");
        assert_eq!(
            msg,
            ChannelMessage::Membership(MembershipUpdate {
                identity: "ayse".to_string(),
                change: MembershipChange::Left,
                team: None,
            })
        );

        let msg = ChannelMessage::from_json(
            r#"{"event":"roomUpdate","data":{"participants":[{"identity":"ali","team":"team1"},{"identity":"veli","team":null}]}}"#,
        )
        .expect("deserialize");
        let ChannelMessage::RoomUpdate(snapshot) = msg else {
            panic!("expected roomUpdate");
        };
        assert_eq!(snapshot.participants.len(), 2);
        assert_eq!(snapshot.participants[0].team, Some(TeamId::new("team1")));
        assert_eq!(snapshot.participants[1].team, None);
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(ChannelMessage::from_json(r#"{"event":"makeGuess","data":{}}"#).is_err());
        assert!(ChannelMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_event_names_match_wire() {
        let msg = ChannelMessage::JoinRoom(RoomJoin {
            room_id: "r1".to_string(),
            identity: "ali".to_string(),
        });
        let value: serde_json::Value =
            serde_json::from_str(&msg.to_json().expect("serialize")).expect("parse");
        assert_eq!(value["event"], msg.event_name());
        assert_eq!(value["data"]["roomId"], "r1");
    }
}
