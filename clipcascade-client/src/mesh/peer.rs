//! Peer-connection abstraction the mesh executor negotiates through.
//!
//! Backends never touch mesh state. Everything they observe (local ICE
//! candidates, remotely created channels, channel open/close, inbound
//! messages) is pushed as a [`PeerEvent`] through the [`PeerEventSink`] they
//! were opened with, and the executor applies it in order.

use async_trait::async_trait;
use clipcascade_core::{CandidateInit, PeerId, SessionDescription};
use tokio::sync::mpsc::UnboundedSender;

use super::executor::MeshEvent;
use crate::SessionError;

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Creates a fresh peer connection whose callbacks report into `events`.
    async fn open(&self, events: PeerEventSink) -> Result<Box<dyn PeerLink>, SessionError>;
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> Result<Box<dyn DataChannel>, SessionError>;
    async fn create_offer(&self) -> Result<SessionDescription, SessionError>;
    async fn create_answer(&self) -> Result<SessionDescription, SessionError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), SessionError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), SessionError>;
    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), SessionError>;
    async fn close(&self);
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: String) -> Result<(), SessionError>;
    async fn close(&self);
}

pub enum PeerEvent {
    LocalCandidate(CandidateInit),
    /// A channel created by the remote side (answerer path).
    RemoteChannel(Box<dyn DataChannel>),
    ChannelOpen,
    ChannelClosed,
    ChannelMessage(String),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            Self::RemoteChannel(_) => f.write_str("RemoteChannel"),
            Self::ChannelOpen => f.write_str("ChannelOpen"),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::ChannelMessage(text) => write!(f, "ChannelMessage({} bytes)", text.len()),
        }
    }
}

/// Per-link handle into the executor queue.
///
/// `generation` identifies the link instance, so events from a link that was
/// already torn down and replaced are ignored.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer_id: PeerId,
    generation: u64,
    tx: UnboundedSender<MeshEvent>,
}

impl PeerEventSink {
    pub(crate) fn new(peer_id: PeerId, generation: u64, tx: UnboundedSender<MeshEvent>) -> Self {
        Self {
            peer_id,
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(MeshEvent::Peer {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }
}
