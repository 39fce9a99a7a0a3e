//! Call types and data structures

use crate::identity::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of the conversation a call belongs to
///
/// Scopes the signaling topic; fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Create a new conversation id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Signaling topic for this conversation, e.g. `videocall:{id}`
    #[must_use]
    pub fn topic(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Call state enumeration
///
/// The single authoritative lifecycle field of a session. Every UI flag is
/// derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No call yet
    Idle,
    /// Offer sent, waiting for the answer
    Offering,
    /// Offer received, waiting for the local user
    Incoming,
    /// Negotiated and running
    Active,
    /// Torn down
    Ended,
}

impl CallState {
    /// Whether a call is in progress (offering, ringing or running)
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Offering | Self::Incoming | Self::Active)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Offering => "offering",
            Self::Incoming => "incoming",
            Self::Active => "active",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer half of the handshake
    Offer,
    /// Answer half of the handshake
    Answer,
}

/// Session description exchanged during offer/answer negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as carried over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    /// Candidate line (`candidate:...`)
    pub candidate: String,
    /// SDP media id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    /// Candidate with only the candidate line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Remote party sent `EndCall`
    RemoteHangup,
    /// Setup failed (media, transport or negotiation)
    SetupFailed,
    /// Connectivity was lost
    TransportFailed,
    /// Lost a simultaneous-offer tie-break
    Superseded,
    /// Controller was shut down
    Shutdown,
}

/// Call event for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// Offer received from a remote party
    IncomingCall {
        /// Caller
        from: UserId,
    },
    /// Offer published to a remote party
    Offering {
        /// Callee
        to: UserId,
    },
    /// Negotiation completed
    Connected {
        /// Remote party
        remote: UserId,
    },
    /// Track received from the remote party
    RemoteTrackAdded {
        /// Remote track id
        track_id: String,
    },
    /// Screen share replaced the camera track
    ScreenShareStarted,
    /// Camera track restored
    ScreenShareStopped,
    /// Session torn down
    Ended {
        /// Why it ended
        reason: EndReason,
    },
    /// Surfaced failure
    Error {
        /// Error description
        error: String,
    },
}
