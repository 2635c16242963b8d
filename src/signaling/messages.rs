//! Message types for the call signaling protocol
//!
//! Every frame is a JSON object of the shape `{"event": <tag>, <tag>: <payload>}`.
//! The serde structs in this file mirror that wire layout exactly; the
//! [`Message`] enum is what the rest of the crate works with.

use crate::call_engine::{IceCandidate, SdpType, SessionDescription};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// An inbound payload that could not be turned into a [`Message`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed signaling payload: {0}")]
    Malformed(String),

    #[error("Failed to encode signaling message: {0}")]
    Encode(String),
}

// ============================================================================
// DOMAIN MESSAGE
// ============================================================================

/// A signaling message exchanged with the call server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Outgoing call carrying the local SDP offer
    Call {
        sdp: SessionDescription,
        auth_zone: bool,
    },

    /// Remote SDP answer
    Answer { sdp: String },

    /// ICE candidate, in either direction
    Candidate(IceCandidate),

    /// Call terminated by either side
    Hangup,

    /// Keypad digit
    Dtmf { digit: String },
}

impl Message {
    /// Wire tag of this message
    pub fn event(&self) -> &'static str {
        match self {
            Message::Call { .. } => "call",
            Message::Answer { .. } => "answer",
            Message::Candidate(_) => "candidate",
            Message::Hangup => "hangup",
            Message::Dtmf { .. } => "dtmf",
        }
    }

    /// Serializes the message into its JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(&WireMessage::from(self.clone()))
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parses a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireMessage =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(wire.into())
    }
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WireMessage {
    Call { call: CallPayload },
    Answer { answer: AnswerPayload },
    Candidate { candidate: CandidatePayload },
    Hangup {},
    Dtmf { dtmf: DtmfPayload },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CallPayload {
    sdp: SdpPayload,
    #[serde(default)]
    auth_zone: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SdpPayload {
    sdp: String,
    #[serde(rename = "type")]
    sdp_type: SdpType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnswerPayload {
    sdp: AnswerSdp,
}

/// The answer's `type` field is implied by the event and not required.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnswerSdp {
    sdp: String,
}

/// Missing and `null` fields both fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CandidatePayload {
    #[serde(default)]
    candidate: Option<String>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DtmfPayload {
    digit: String,
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        match message {
            Message::Call { sdp, auth_zone } => WireMessage::Call {
                call: CallPayload {
                    sdp: SdpPayload {
                        sdp: sdp.sdp,
                        sdp_type: sdp.sdp_type,
                    },
                    auth_zone,
                },
            },
            Message::Answer { sdp } => WireMessage::Answer {
                answer: AnswerPayload {
                    sdp: AnswerSdp { sdp },
                },
            },
            Message::Candidate(candidate) => WireMessage::Candidate {
                candidate: CandidatePayload {
                    candidate: Some(candidate.candidate),
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: Some(candidate.sdp_mline_index),
                },
            },
            Message::Hangup => WireMessage::Hangup {},
            Message::Dtmf { digit } => WireMessage::Dtmf {
                dtmf: DtmfPayload { digit },
            },
        }
    }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        match wire {
            WireMessage::Call { call } => Message::Call {
                sdp: SessionDescription {
                    sdp_type: call.sdp.sdp_type,
                    sdp: call.sdp.sdp,
                },
                auth_zone: call.auth_zone,
            },
            WireMessage::Answer { answer } => Message::Answer {
                sdp: answer.sdp.sdp,
            },
            WireMessage::Candidate { candidate } => Message::Candidate(IceCandidate {
                candidate: candidate.candidate.unwrap_or_default(),
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index.unwrap_or(0),
            }),
            WireMessage::Hangup {} => Message::Hangup,
            WireMessage::Dtmf { dtmf } => Message::Dtmf { digit: dtmf.digit },
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn as_json(message: &Message) -> Value {
        serde_json::from_str(&message.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_call_wire_shape() {
        let message = Message::Call {
            sdp: SessionDescription::offer("v=0"),
            auth_zone: true,
        };

        assert_eq!(
            as_json(&message),
            json!({
                "event": "call",
                "call": {
                    "sdp": { "sdp": "v=0", "type": "offer" },
                    "auth_zone": true
                }
            })
        );
    }

    #[test]
    fn test_hangup_has_no_payload() {
        assert_eq!(as_json(&Message::Hangup), json!({ "event": "hangup" }));
        assert_eq!(Message::decode(r#"{"event":"hangup"}"#), Ok(Message::Hangup));
        assert_eq!(
            Message::decode(r#"{"event":"hangup","hangup":{}}"#),
            Ok(Message::Hangup)
        );
    }

    #[test]
    fn test_dtmf_wire_shape() {
        let message = Message::Dtmf {
            digit: "5".to_string(),
        };
        assert_eq!(
            as_json(&message),
            json!({ "event": "dtmf", "dtmf": { "digit": "5" } })
        );
    }

    #[test]
    fn test_decode_answer() {
        let text = r#"{"event":"answer","answer":{"sdp":{"sdp":"v=0\r\n","type":"answer"}}}"#;
        assert_eq!(
            Message::decode(text),
            Ok(Message::Answer {
                sdp: "v=0\r\n".to_string()
            })
        );
    }

    #[test]
    fn test_candidate_round_trip_without_mid() {
        let candidate = IceCandidate {
            candidate: "abc".to_string(),
            sdp_mid: None,
            sdp_mline_index: 0,
        };
        let encoded = Message::Candidate(candidate.clone()).encode().unwrap();

        assert!(!encoded.contains("sdpMid"));
        assert_eq!(Message::decode(&encoded), Ok(Message::Candidate(candidate)));
    }

    #[test]
    fn test_candidate_defaults_when_fields_absent() {
        let decoded = Message::decode(r#"{"event":"candidate","candidate":{"candidate":"abc"}}"#);
        assert_eq!(
            decoded,
            Ok(Message::Candidate(IceCandidate {
                candidate: "abc".to_string(),
                sdp_mid: None,
                sdp_mline_index: 0,
            }))
        );
    }

    #[test]
    fn test_candidate_null_fields_fall_back_to_defaults() {
        let decoded = Message::decode(
            r#"{"event":"candidate","candidate":{"candidate":"abc","sdpMid":null,"sdpMLineIndex":null}}"#,
        );
        assert_eq!(
            decoded,
            Ok(Message::Candidate(IceCandidate {
                candidate: "abc".to_string(),
                sdp_mid: None,
                sdp_mline_index: 0,
            }))
        );

        let decoded = Message::decode(
            r#"{"event":"candidate","candidate":{"candidate":null,"sdpMLineIndex":1}}"#,
        );
        assert_eq!(
            decoded,
            Ok(Message::Candidate(IceCandidate {
                candidate: String::new(),
                sdp_mid: None,
                sdp_mline_index: 1,
            }))
        );
    }

    #[test]
    fn test_candidate_keeps_mid_and_index() {
        let decoded = Message::decode(
            r#"{"event":"candidate","candidate":{"candidate":"c","sdpMid":"audio","sdpMLineIndex":2}}"#,
        )
        .unwrap();
        assert_eq!(
            decoded,
            Message::Candidate(IceCandidate {
                candidate: "c".to_string(),
                sdp_mid: Some("audio".to_string()),
                sdp_mline_index: 2,
            })
        );
    }

    #[test]
    fn test_malformed_payloads_are_rejected() {
        for text in [
            "not json",
            r#"{"event":"unknown"}"#,
            r#"{"answer":{"sdp":{"sdp":"x"}}}"#,
            r#"{"event":"answer","answer":{}}"#,
            r#"{"event":"dtmf"}"#,
        ] {
            assert!(
                matches!(Message::decode(text), Err(ProtocolError::Malformed(_))),
                "expected {text} to be rejected"
            );
        }
    }
}
