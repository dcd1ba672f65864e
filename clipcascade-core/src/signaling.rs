use serde::{Deserialize, Serialize};

use crate::CoreError;

pub type PeerId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".to_owned(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".to_owned(),
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Messages exchanged with the signaling server, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalMessage {
    AssignedId {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    PeerList {
        peers: Vec<PeerId>,
    },
    Offer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: PeerId,
        #[serde(rename = "toPeerId")]
        to_peer_id: PeerId,
        offer: SessionDescription,
    },
    Answer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: PeerId,
        #[serde(rename = "toPeerId")]
        to_peer_id: PeerId,
        answer: SessionDescription,
    },
    IceCandidate {
        #[serde(rename = "fromPeerId")]
        from_peer_id: PeerId,
        #[serde(rename = "toPeerId")]
        to_peer_id: PeerId,
        candidate: CandidateInit,
    },
}

impl SignalMessage {
    pub fn encode(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw)
            .map_err(|err| CoreError::SignalingProtocol(format!("bad signaling message: {err}")))
    }

    /// Recipient of a peer-addressed message.
    pub fn to_peer_id(&self) -> Option<&str> {
        match self {
            Self::Offer { to_peer_id, .. }
            | Self::Answer { to_peer_id, .. }
            | Self::IceCandidate { to_peer_id, .. } => Some(to_peer_id),
            Self::AssignedId { .. } | Self::PeerList { .. } => None,
        }
    }

    pub fn from_peer_id(&self) -> Option<&str> {
        match self {
            Self::Offer { from_peer_id, .. }
            | Self::Answer { from_peer_id, .. }
            | Self::IceCandidate { from_peer_id, .. } => Some(from_peer_id),
            Self::AssignedId { .. } | Self::PeerList { .. } => None,
        }
    }
}
