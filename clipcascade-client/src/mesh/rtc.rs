use std::sync::Arc;

use async_trait::async_trait;
use clipcascade_core::{CandidateInit, SessionDescription};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use webrtc::{
    api::{
        API, APIBuilder, interceptor_registry::register_default_interceptors,
        media_engine::MediaEngine,
    },
    data_channel::{
        RTCDataChannel, data_channel_message::DataChannelMessage,
        data_channel_state::RTCDataChannelState,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        RTCPeerConnection, configuration::RTCConfiguration,
        sdp::session_description::RTCSessionDescription,
    },
};

use super::peer::{DataChannel, PeerConnector, PeerEvent, PeerEventSink, PeerLink};
use crate::SessionError;

fn peer_error(context: &str, err: impl std::fmt::Display) -> SessionError {
    SessionError::Peer(format!("{context}: {err}"))
}

/// Both description types serialize as `{"type", "sdp"}`.
fn convert<A: Serialize, B: DeserializeOwned>(value: &A) -> Result<B, SessionError> {
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|err| peer_error("session description", err))
}

/// Peer connections on the `webrtc` crate, using one STUN server.
pub struct WebRtcConnector {
    api: API,
    stun_url: String,
}

impl WebRtcConnector {
    pub fn new(stun_url: impl Into<String>) -> Result<Self, SessionError> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|err| peer_error("interceptor setup", err))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            stun_url: stun_url.into(),
        })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn open(&self, events: PeerEventSink) -> Result<Box<dyn PeerLink>, SessionError> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.stun_url.clone()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|err| peer_error("create peer connection", err))?,
        );

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(PeerEvent::LocalCandidate(CandidateInit {
                        candidate: with_candidate_prefix(init.candidate),
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Err(err) => warn!(peer_id = sink.peer_id(), "unusable local candidate: {}", err),
                }
            })
        }));

        let sink = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = sink.clone();
            Box::pin(async move {
                debug!(peer_id = sink.peer_id(), label = dc.label(), "remote data channel");
                let channel = WebRtcChannel::wire(dc, &sink);
                sink.emit(PeerEvent::RemoteChannel(Box::new(channel)));
            })
        }));

        Ok(Box::new(WebRtcLink { pc, events }))
    }
}

fn with_candidate_prefix(candidate: String) -> String {
    if candidate.starts_with("candidate:") {
        candidate
    } else {
        format!("candidate:{candidate}")
    }
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSink,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_data_channel(&self, label: &str) -> Result<Box<dyn DataChannel>, SessionError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|err| peer_error("create data channel", err))?;
        Ok(Box::new(WebRtcChannel::wire(dc, &self.events)))
    }

    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| peer_error("create offer", err))?;
        convert(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| peer_error("create answer", err))?;
        convert(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), SessionError> {
        let description: RTCSessionDescription = convert(&description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| peer_error("set local description", err))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), SessionError> {
        let description: RTCSessionDescription = convert(&description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| peer_error("set remote description", err))
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), SessionError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|err| peer_error("add ice candidate", err))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(peer_id = self.events.peer_id(), "peer connection close: {}", err);
        }
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl WebRtcChannel {
    /// Routes the channel's callbacks into the executor queue.
    fn wire(dc: Arc<RTCDataChannel>, sink: &PeerEventSink) -> Self {
        let on_open = sink.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move { on_open.emit(PeerEvent::ChannelOpen) })
        }));

        let on_close = sink.clone();
        dc.on_close(Box::new(move || {
            let sink = on_close.clone();
            Box::pin(async move { sink.emit(PeerEvent::ChannelClosed) })
        }));

        let on_message = sink.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = on_message.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => sink.emit(PeerEvent::ChannelMessage(text)),
                    Err(_) => warn!(peer_id = sink.peer_id(), "dropping non-UTF-8 channel message"),
                }
            })
        }));

        Self { dc }
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|err| peer_error("data channel send", err))
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!("data channel close: {}", err);
        }
    }
}
