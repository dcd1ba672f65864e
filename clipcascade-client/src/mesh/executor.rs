use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use clipcascade_core::{
    CandidateInit, ClipboardEvent, CoreError, DATA_CHANNEL_LABEL, IceCandidateLine,
    OutboundTransfer, PayloadCodec, PeerId, Reassembler, Reassembly, SessionDescription,
    SignalMessage, WireEnvelope,
};
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError},
    oneshot,
};
use tracing::{debug, info, warn};

use super::peer::{DataChannel, PeerConnector, PeerEvent, PeerEventSink, PeerLink};
use crate::{SessionError, collab::ClipboardSink, session::SessionShared};

/// Work items for the mesh executor. Signaling reader, backend callbacks and
/// the public session API only ever talk to peer state through these.
pub enum MeshEvent {
    SignalingUp { outbox: UnboundedSender<String> },
    SignalingDown,
    Signal(SignalMessage),
    Peer {
        peer_id: PeerId,
        generation: u64,
        event: PeerEvent,
    },
    Send(ClipboardEvent),
    Shutdown(oneshot::Sender<()>),
}

impl fmt::Debug for MeshEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignalingUp { .. } => f.write_str("SignalingUp"),
            Self::SignalingDown => f.write_str("SignalingDown"),
            Self::Signal(signal) => f.debug_tuple("Signal").field(signal).finish(),
            Self::Peer {
                peer_id,
                generation,
                event,
            } => f
                .debug_struct("Peer")
                .field("peer_id", peer_id)
                .field("generation", generation)
                .field("event", event)
                .finish(),
            Self::Send(event) => write!(f, "Send({})", event.kind.as_str()),
            Self::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

/// Snapshot of the mesh shown in status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshStats {
    pub live_connections: usize,
    pub sending: Option<(usize, usize)>,
    pub receiving: Option<(usize, usize)>,
}

impl fmt::Display for MeshStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peers: {}", self.live_connections)?;
        if let Some((sent, total)) = self.sending {
            write!(f, " | Sending: {sent}/{total}")?;
        }
        if let Some((received, total)) = self.receiving {
            write!(f, " | Receiving: {received}/{total}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Negotiating,
    Open,
}

struct PeerEntry {
    link: Box<dyn PeerLink>,
    channel: Option<Box<dyn DataChannel>>,
    state: PeerState,
    generation: u64,
}

pub(crate) struct MeshParts {
    pub connector: Arc<dyn PeerConnector>,
    pub events: UnboundedSender<MeshEvent>,
    pub shared: Arc<SessionShared>,
    pub codec: PayloadCodec,
    pub sink: Arc<dyn ClipboardSink>,
    pub stats: Arc<Mutex<MeshStats>>,
    pub fragment_bytes: usize,
}

/// Owns every peer connection, data channel and fragment buffer of a mesh
/// session. Runs as one task; nothing else mutates this state.
pub(crate) struct PeerMesh {
    my_peer_id: Option<PeerId>,
    peers: HashMap<PeerId, PeerEntry>,
    next_generation: u64,
    outbox: Option<UnboundedSender<String>>,
    reassembler: Reassembler,
    outbound: Option<OutboundTransfer>,
    live_connections: usize,
    parts: MeshParts,
}

impl PeerMesh {
    pub(crate) fn new(parts: MeshParts) -> Self {
        Self {
            my_peer_id: None,
            peers: HashMap::new(),
            next_generation: 0,
            outbox: None,
            reassembler: Reassembler::new(parts.codec.limits().local_max),
            outbound: None,
            live_connections: 0,
            parts,
        }
    }

    /// Processes queued events, pushing one outbound fragment between events
    /// while a transfer is in flight, so a newer clipboard change is seen
    /// before the next fragment of a stale one goes out.
    pub(crate) async fn run(mut self, mut events: UnboundedReceiver<MeshEvent>) {
        loop {
            let event = if self.outbound.is_some() {
                match events.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => {
                        self.pump_fragment().await;
                        self.publish_stats();
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match events.recv().await {
                    Some(event) => event,
                    None => break,
                }
            };
            self.handle(event).await;
            self.publish_stats();
        }
        self.teardown_all().await;
        debug!("mesh executor stopped");
    }

    pub(crate) async fn handle(&mut self, event: MeshEvent) {
        let result = match event {
            MeshEvent::SignalingUp { outbox } => {
                self.outbox = Some(outbox);
                Ok(())
            }
            MeshEvent::SignalingDown => {
                self.outbox = None;
                Ok(())
            }
            MeshEvent::Signal(signal) => self.handle_signal(signal).await,
            MeshEvent::Peer {
                peer_id,
                generation,
                event,
            } => {
                if self
                    .peers
                    .get(&peer_id)
                    .is_some_and(|entry| entry.generation == generation)
                {
                    self.handle_peer_event(&peer_id, event).await
                } else {
                    debug!(peer_id = %peer_id, ?event, "ignoring event from a retired link");
                    Ok(())
                }
            }
            MeshEvent::Send(event) => self.start_transfer(event),
            MeshEvent::Shutdown(ack) => {
                self.teardown_all().await;
                self.my_peer_id = None;
                self.outbox = None;
                self.outbound = None;
                self.reassembler.reset();
                let _ = ack.send(());
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!("mesh event failed: {}", err);
        }
    }

    fn publish_stats(&self) {
        let snapshot = MeshStats {
            live_connections: self.live_connections,
            sending: self
                .outbound
                .as_ref()
                .filter(|transfer| transfer.is_fragmented())
                .map(|transfer| (transfer.sent(), transfer.total())),
            receiving: self.reassembler.progress(),
        };
        *self
            .parts
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    fn send_signal(&self, signal: SignalMessage) -> Result<(), SessionError> {
        let text = signal.encode()?;
        match &self.outbox {
            Some(outbox) if outbox.send(text).is_ok() => Ok(()),
            _ => Err(SessionError::Transport(
                "signaling socket is not connected".to_owned(),
            )),
        }
    }

    fn my_id(&self) -> Result<PeerId, SessionError> {
        self.my_peer_id.clone().ok_or_else(|| {
            SessionError::Core(CoreError::SignalingProtocol(
                "peer message before ASSIGNED_ID".to_owned(),
            ))
        })
    }

    async fn handle_signal(&mut self, signal: SignalMessage) -> Result<(), SessionError> {
        match signal {
            SignalMessage::AssignedId { peer_id } => {
                if let Some(previous) = &self.my_peer_id
                    && *previous != peer_id
                {
                    info!(previous = %previous, current = %peer_id, "peer id changed, dropping every peer");
                    self.teardown_all().await;
                }
                self.my_peer_id = Some(peer_id);
                Ok(())
            }
            SignalMessage::PeerList { peers } => self.handle_peer_list(peers).await,
            SignalMessage::Offer {
                from_peer_id,
                to_peer_id,
                offer,
            } => {
                if self.addressed_to_me(&to_peer_id) {
                    self.handle_offer(from_peer_id, offer).await
                } else {
                    Ok(())
                }
            }
            SignalMessage::Answer {
                from_peer_id,
                to_peer_id,
                answer,
            } => {
                if !self.addressed_to_me(&to_peer_id) {
                    return Ok(());
                }
                let entry = self.peers.get(&from_peer_id).ok_or_else(|| {
                    SessionError::Peer(format!("answer from unknown peer {from_peer_id}"))
                })?;
                entry.link.set_remote_description(answer).await
            }
            SignalMessage::IceCandidate {
                from_peer_id,
                to_peer_id,
                candidate,
            } => {
                if !self.addressed_to_me(&to_peer_id) {
                    return Ok(());
                }
                let line = IceCandidateLine::parse(&candidate.candidate)?;
                let entry = self.peers.get(&from_peer_id).ok_or_else(|| {
                    SessionError::Peer(format!("candidate from unknown peer {from_peer_id}"))
                })?;
                entry
                    .link
                    .add_ice_candidate(CandidateInit {
                        candidate: line.to_string(),
                        ..candidate
                    })
                    .await
            }
        }
    }

    fn addressed_to_me(&self, to_peer_id: &str) -> bool {
        let mine = self.my_peer_id.as_deref() == Some(to_peer_id);
        if !mine {
            debug!(to_peer_id, "ignoring signal addressed to another peer");
        }
        mine
    }

    async fn handle_peer_list(&mut self, peers: Vec<PeerId>) -> Result<(), SessionError> {
        let my_id = self.my_id()?;
        let wanted: HashSet<&str> = peers
            .iter()
            .map(String::as_str)
            .filter(|id| *id != my_id)
            .collect();

        let stale: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();
        for peer_id in stale {
            debug!(peer_id = %peer_id, "removing stale peer");
            self.teardown(&peer_id).await;
        }

        for peer_id in peers {
            if peer_id == my_id || self.peers.contains_key(&peer_id) {
                continue;
            }
            if let Err(err) = self.add_peer(&my_id, &peer_id).await {
                warn!(peer_id = %peer_id, "failed to start negotiation: {}", err);
                self.teardown(&peer_id).await;
            }
        }
        Ok(())
    }

    async fn open_link(&mut self, peer_id: &str) -> Result<(), SessionError> {
        let generation = self.next_generation;
        self.next_generation += 1;
        let sink = PeerEventSink::new(peer_id.to_owned(), generation, self.parts.events.clone());
        let link = self.parts.connector.open(sink).await?;
        self.peers.insert(
            peer_id.to_owned(),
            PeerEntry {
                link,
                channel: None,
                state: PeerState::Negotiating,
                generation,
            },
        );
        Ok(())
    }

    /// The lexicographically smaller id offers; the other side waits.
    async fn add_peer(&mut self, my_id: &str, peer_id: &str) -> Result<(), SessionError> {
        self.open_link(peer_id).await?;
        if my_id >= peer_id {
            debug!(peer_id, "waiting for offer");
            return Ok(());
        }

        let offer = {
            let Some(entry) = self.peers.get_mut(peer_id) else {
                return Ok(());
            };
            let channel = entry.link.create_data_channel(DATA_CHANNEL_LABEL).await?;
            entry.channel = Some(channel);
            let offer = entry.link.create_offer().await?;
            entry.link.set_local_description(offer.clone()).await?;
            offer
        };
        debug!(peer_id, "sending offer");
        self.send_signal(SignalMessage::Offer {
            from_peer_id: my_id.to_owned(),
            to_peer_id: peer_id.to_owned(),
            offer,
        })
    }

    async fn handle_offer(
        &mut self,
        from_peer_id: PeerId,
        offer: SessionDescription,
    ) -> Result<(), SessionError> {
        let my_id = self.my_id()?;
        if !self.peers.contains_key(&from_peer_id) {
            self.open_link(&from_peer_id).await?;
        }
        let answer = {
            let Some(entry) = self.peers.get(&from_peer_id) else {
                return Ok(());
            };
            entry.link.set_remote_description(offer).await?;
            let answer = entry.link.create_answer().await?;
            entry.link.set_local_description(answer.clone()).await?;
            answer
        };
        debug!(peer_id = %from_peer_id, "sending answer");
        self.send_signal(SignalMessage::Answer {
            from_peer_id: my_id,
            to_peer_id: from_peer_id,
            answer,
        })
    }

    async fn handle_peer_event(&mut self, peer_id: &str, event: PeerEvent) -> Result<(), SessionError> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let line = IceCandidateLine::parse(&candidate.candidate)?;
                let my_id = self.my_id()?;
                self.send_signal(SignalMessage::IceCandidate {
                    from_peer_id: my_id,
                    to_peer_id: peer_id.to_owned(),
                    candidate: CandidateInit {
                        candidate: line.to_string(),
                        ..candidate
                    },
                })
            }
            PeerEvent::RemoteChannel(channel) => {
                let open = channel.is_open();
                if let Some(entry) = self.peers.get_mut(peer_id)
                    && let Some(previous) = entry.channel.replace(channel)
                {
                    previous.close().await;
                }
                if open {
                    self.mark_open(peer_id);
                }
                Ok(())
            }
            PeerEvent::ChannelOpen => {
                self.mark_open(peer_id);
                Ok(())
            }
            PeerEvent::ChannelClosed => {
                info!(peer_id, "data channel closed");
                self.teardown(peer_id).await;
                Ok(())
            }
            PeerEvent::ChannelMessage(text) => {
                self.receive(&text);
                Ok(())
            }
        }
    }

    fn mark_open(&mut self, peer_id: &str) {
        if let Some(entry) = self.peers.get_mut(peer_id)
            && entry.state != PeerState::Open
        {
            entry.state = PeerState::Open;
            self.live_connections += 1;
            info!(peer_id, live = self.live_connections, "data channel open");
        }
    }

    async fn teardown(&mut self, peer_id: &str) {
        let Some(entry) = self.peers.remove(peer_id) else {
            return;
        };
        if entry.state == PeerState::Open {
            self.live_connections = self.live_connections.saturating_sub(1);
        }
        if let Some(channel) = entry.channel {
            channel.close().await;
        }
        entry.link.close().await;
    }

    async fn teardown_all(&mut self) {
        let ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer_id in ids {
            self.teardown(&peer_id).await;
        }
        self.live_connections = 0;
    }

    fn start_transfer(&mut self, event: ClipboardEvent) -> Result<(), SessionError> {
        if !self.parts.shared.has_changed(&event.content) {
            return Ok(());
        }
        if self.outbound.take().is_some() {
            debug!("superseding unfinished outbound transfer");
        }
        self.reassembler.reset();

        let sealed = self.parts.codec.seal(&event)?;
        let transfer = OutboundTransfer::new(sealed, self.parts.fragment_bytes)?;
        debug!(id = %transfer.id(), fragments = transfer.total(), "outbound transfer queued");
        self.outbound = Some(transfer);
        Ok(())
    }

    /// Sends the next fragment of the current transfer to every open channel.
    /// Peers still negotiating miss it.
    pub(crate) async fn pump_fragment(&mut self) {
        let Some(transfer) = self.outbound.as_mut() else {
            return;
        };
        let frame = transfer.next_frame().map(str::to_owned);
        if transfer.is_complete() {
            self.outbound = None;
        }
        let Some(frame) = frame else {
            return;
        };

        for (peer_id, entry) in &self.peers {
            let Some(channel) = entry.channel.as_ref() else {
                continue;
            };
            if entry.state != PeerState::Open || !channel.is_open() {
                continue;
            }
            if let Err(err) = channel.send_text(frame.clone()).await {
                warn!(peer_id = %peer_id, "fragment send failed: {}", err);
            }
        }
    }

    fn receive(&mut self, text: &str) {
        let envelope = match WireEnvelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dropping malformed peer message: {}", err);
                return;
            }
        };

        let (payload, kind) = match self.reassembler.accept(envelope) {
            Ok(Reassembly::Complete { payload, kind }) => (payload, kind),
            Ok(Reassembly::Pending { received, total }) => {
                debug!(received, total, "fragment buffered");
                return;
            }
            Err(err @ CoreError::Fragmentation { .. }) => {
                warn!("missing fragments, transfer aborted: {}", err);
                return;
            }
            Err(err) => {
                warn!("dropping peer payload: {}", err);
                return;
            }
        };

        let event = match self.parts.codec.open(&payload, kind) {
            Ok(event) => event,
            Err(err @ (CoreError::Authentication | CoreError::InvalidEnvelope(_))) => {
                warn!(
                    "dropping undecryptable payload ({}); check that encryption is set up the same on every device",
                    err
                );
                return;
            }
            Err(err) => {
                warn!("dropping peer payload: {}", err);
                return;
            }
        };

        if !self.parts.shared.has_changed(&event.content) {
            return;
        }
        match self.parts.sink.write_clipboard(event) {
            Ok(()) => {
                if self.outbound.take().is_some() {
                    debug!("inbound payload applied, outbound transfer aborted");
                }
            }
            Err(err) => warn!("failed to apply inbound clipboard: {}", err),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use clipcascade_core::{FragmentMetadata, PayloadKind, SizeLimits};
    use tokio::sync::mpsc;

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeChannelState {
        pub(crate) open: AtomicBool,
        pub(crate) closed: AtomicBool,
        pub(crate) sent: Mutex<Vec<String>>,
    }

    struct FakeChannel(Arc<FakeChannelState>);

    #[async_trait]
    impl DataChannel for FakeChannel {
        fn is_open(&self) -> bool {
            self.0.open.load(Ordering::SeqCst) && !self.0.closed.load(Ordering::SeqCst)
        }

        async fn send_text(&self, text: String) -> Result<(), SessionError> {
            self.0.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn close(&self) {
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Records every call made on each peer link and hands out inspectable
    /// channels.
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub(crate) opened: Mutex<Vec<PeerId>>,
        pub(crate) calls: Arc<Mutex<Vec<(PeerId, String)>>>,
        pub(crate) channels: Arc<Mutex<HashMap<PeerId, Arc<FakeChannelState>>>>,
        pub(crate) sinks: Mutex<HashMap<PeerId, PeerEventSink>>,
    }

    impl FakeConnector {
        pub(crate) fn calls_for(&self, peer_id: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == peer_id)
                .map(|(_, call)| call.clone())
                .collect()
        }

        pub(crate) fn channel(&self, peer_id: &str) -> Arc<FakeChannelState> {
            self.channels.lock().unwrap()[peer_id].clone()
        }

        pub(crate) fn sink(&self, peer_id: &str) -> PeerEventSink {
            self.sinks.lock().unwrap()[peer_id].clone()
        }
    }

    struct FakeLink {
        peer_id: PeerId,
        calls: Arc<Mutex<Vec<(PeerId, String)>>>,
        channels: Arc<Mutex<HashMap<PeerId, Arc<FakeChannelState>>>>,
    }

    impl FakeLink {
        fn record(&self, call: impl Into<String>) {
            self.calls
                .lock()
                .unwrap()
                .push((self.peer_id.clone(), call.into()));
        }
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn open(&self, events: PeerEventSink) -> Result<Box<dyn PeerLink>, SessionError> {
            let peer_id = events.peer_id().to_owned();
            self.opened.lock().unwrap().push(peer_id.clone());
            self.sinks.lock().unwrap().insert(peer_id.clone(), events);
            Ok(Box::new(FakeLink {
                peer_id,
                calls: self.calls.clone(),
                channels: self.channels.clone(),
            }))
        }
    }

    #[async_trait]
    impl PeerLink for FakeLink {
        async fn create_data_channel(&self, label: &str) -> Result<Box<dyn DataChannel>, SessionError> {
            self.record(format!("create_data_channel:{label}"));
            let state = Arc::new(FakeChannelState::default());
            self.channels
                .lock()
                .unwrap()
                .insert(self.peer_id.clone(), state.clone());
            Ok(Box::new(FakeChannel(state)))
        }

        async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
            self.record("create_offer");
            Ok(SessionDescription::offer(format!("offer-sdp-{}", self.peer_id)))
        }

        async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
            self.record("create_answer");
            Ok(SessionDescription::answer(format!("answer-sdp-{}", self.peer_id)))
        }

        async fn set_local_description(&self, description: SessionDescription) -> Result<(), SessionError> {
            self.record(format!("set_local:{}", description.sdp_type));
            Ok(())
        }

        async fn set_remote_description(&self, description: SessionDescription) -> Result<(), SessionError> {
            self.record(format!("set_remote:{}", description.sdp_type));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), SessionError> {
            self.record(format!("add_ice:{}", candidate.candidate));
            Ok(())
        }

        async fn close(&self) {
            self.record("close");
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) written: Mutex<Vec<ClipboardEvent>>,
    }

    impl ClipboardSink for RecordingSink {
        fn write_clipboard(&self, event: ClipboardEvent) -> Result<(), String> {
            self.written.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct Harness {
        mesh: PeerMesh,
        connector: Arc<FakeConnector>,
        sink: Arc<RecordingSink>,
        stats: Arc<Mutex<MeshStats>>,
        events: UnboundedReceiver<MeshEvent>,
        outbox: UnboundedReceiver<String>,
    }

    impl Harness {
        async fn new(my_id: &str, fragment_bytes: usize) -> Self {
            let connector = Arc::new(FakeConnector::default());
            let sink = Arc::new(RecordingSink::default());
            let stats = Arc::new(Mutex::new(MeshStats::default()));
            let (events_tx, events) = mpsc::unbounded_channel();
            let (outbox_tx, outbox) = mpsc::unbounded_channel();
            let mut mesh = PeerMesh::new(MeshParts {
                connector: connector.clone(),
                events: events_tx,
                shared: Arc::new(SessionShared::new()),
                codec: PayloadCodec::new(None, SizeLimits::default()),
                sink: sink.clone(),
                stats: stats.clone(),
                fragment_bytes,
            });
            mesh.handle(MeshEvent::SignalingUp { outbox: outbox_tx }).await;
            mesh.handle(MeshEvent::Signal(SignalMessage::AssignedId {
                peer_id: my_id.to_owned(),
            }))
            .await;
            Self {
                mesh,
                connector,
                sink,
                stats,
                events,
                outbox,
            }
        }

        async fn peer_list(&mut self, peers: &[&str]) {
            self.mesh
                .handle(MeshEvent::Signal(SignalMessage::PeerList {
                    peers: peers.iter().map(|id| (*id).to_owned()).collect(),
                }))
                .await;
        }

        /// Applies every event the fake backend queued.
        async fn drain(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.mesh.handle(event).await;
            }
            self.mesh.publish_stats();
        }

        async fn open_channel(&mut self, peer_id: &str) {
            self.connector.channel(peer_id).open.store(true, Ordering::SeqCst);
            self.connector.sink(peer_id).emit(PeerEvent::ChannelOpen);
            self.drain().await;
        }

        async fn flush_outbound(&mut self) {
            while self.mesh.outbound.is_some() {
                self.mesh.pump_fragment().await;
            }
            self.mesh.publish_stats();
        }

        fn signals(&mut self) -> Vec<SignalMessage> {
            let mut signals = Vec::new();
            while let Ok(text) = self.outbox.try_recv() {
                signals.push(SignalMessage::decode(&text).unwrap());
            }
            signals
        }

        fn stats(&self) -> MeshStats {
            *self.stats.lock().unwrap()
        }
    }

    fn opened(connector: &FakeConnector) -> Vec<PeerId> {
        connector.opened.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn lower_peer_id_creates_channel_and_offers() {
        let mut harness = Harness::new("p1", 1024).await;
        harness.peer_list(&["p1", "p2"]).await;

        assert_eq!(opened(&harness.connector), vec!["p2"]);
        assert_eq!(
            harness.connector.calls_for("p2"),
            vec!["create_data_channel:cliptext", "create_offer", "set_local:offer"]
        );
        assert_eq!(
            harness.signals(),
            vec![SignalMessage::Offer {
                from_peer_id: "p1".to_owned(),
                to_peer_id: "p2".to_owned(),
                offer: SessionDescription::offer("offer-sdp-p2"),
            }]
        );
    }

    #[tokio::test]
    async fn higher_peer_id_waits_for_offer() {
        let mut harness = Harness::new("p2", 1024).await;
        harness.peer_list(&["p1", "p2"]).await;

        assert_eq!(opened(&harness.connector), vec!["p1"]);
        assert!(harness.connector.calls_for("p1").is_empty());
        assert!(harness.signals().is_empty());
    }

    #[tokio::test]
    async fn peer_list_diff_removes_absent_and_adds_new_once() {
        let mut harness = Harness::new("a", 1024).await;
        harness.peer_list(&["a", "pa", "pb", "pc"]).await;
        harness.peer_list(&["a", "pb", "pc", "pd"]).await;
        harness.peer_list(&["a", "pb", "pc", "pd"]).await;

        assert_eq!(opened(&harness.connector), vec!["pa", "pb", "pc", "pd"]);
        assert_eq!(harness.connector.calls_for("pa").last().unwrap(), "close");
        assert!(harness.connector.channel("pa").closed.load(Ordering::SeqCst));
        for untouched in ["pb", "pc"] {
            assert!(!harness.connector.calls_for(untouched).contains(&"close".to_owned()));
        }
        let mut remaining: Vec<_> = harness.mesh.peers.keys().cloned().collect();
        remaining.sort();
        assert_eq!(remaining, vec!["pb", "pc", "pd"]);
    }

    #[tokio::test]
    async fn own_id_is_never_a_peer() {
        let mut harness = Harness::new("p5", 1024).await;
        harness.peer_list(&["p5"]).await;
        assert!(harness.mesh.peers.is_empty());
        assert!(opened(&harness.connector).is_empty());
    }

    #[tokio::test]
    async fn offer_is_answered_and_remote_channel_opens() {
        let mut harness = Harness::new("p2", 1024).await;
        harness
            .mesh
            .handle(MeshEvent::Signal(SignalMessage::Offer {
                from_peer_id: "p1".to_owned(),
                to_peer_id: "p2".to_owned(),
                offer: SessionDescription::offer("v=0"),
            }))
            .await;

        assert_eq!(
            harness.connector.calls_for("p1"),
            vec!["set_remote:offer", "create_answer", "set_local:answer"]
        );
        assert_eq!(
            harness.signals(),
            vec![SignalMessage::Answer {
                from_peer_id: "p2".to_owned(),
                to_peer_id: "p1".to_owned(),
                answer: SessionDescription::answer("answer-sdp-p1"),
            }]
        );

        let state = Arc::new(FakeChannelState::default());
        state.open.store(true, Ordering::SeqCst);
        harness
            .connector
            .sink("p1")
            .emit(PeerEvent::RemoteChannel(Box::new(FakeChannel(state))));
        harness.drain().await;
        assert_eq!(harness.stats().live_connections, 1);
        assert_eq!(harness.stats().to_string(), "Peers: 1");
    }

    #[tokio::test]
    async fn remote_candidates_are_parsed_before_use() {
        let mut harness = Harness::new("p2", 1024).await;
        harness.peer_list(&["p1", "p2"]).await;

        let line = "candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx raddr 10.0.0.4 rport 46154 generation 0";
        for candidate in ["garbage", line] {
            harness
                .mesh
                .handle(MeshEvent::Signal(SignalMessage::IceCandidate {
                    from_peer_id: "p1".to_owned(),
                    to_peer_id: "p2".to_owned(),
                    candidate: CandidateInit {
                        candidate: candidate.to_owned(),
                        sdp_mid: Some("0".to_owned()),
                        sdp_mline_index: Some(0),
                    },
                }))
                .await;
        }

        assert_eq!(harness.connector.calls_for("p1"), vec![format!("add_ice:{line}")]);
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_to_their_peer() {
        let mut harness = Harness::new("p1", 1024).await;
        harness.peer_list(&["p1", "p2"]).await;
        harness.signals();

        let line = "candidate:1 1 udp 2122260223 192.168.1.10 53421 typ host";
        harness
            .connector
            .sink("p2")
            .emit(PeerEvent::LocalCandidate(CandidateInit {
                candidate: line.to_owned(),
                sdp_mid: Some("0".to_owned()),
                sdp_mline_index: Some(0),
            }));
        harness.drain().await;

        assert_eq!(
            harness.signals(),
            vec![SignalMessage::IceCandidate {
                from_peer_id: "p1".to_owned(),
                to_peer_id: "p2".to_owned(),
                candidate: CandidateInit {
                    candidate: line.to_owned(),
                    sdp_mid: Some("0".to_owned()),
                    sdp_mline_index: Some(0),
                },
            }]
        );
    }

    #[tokio::test]
    async fn send_fans_out_only_to_open_channels() {
        let mut harness = Harness::new("p0", 1024).await;
        harness.peer_list(&["p0", "p1", "p2"]).await;
        harness.open_channel("p1").await;
        assert_eq!(harness.stats().live_connections, 1);

        harness
            .mesh
            .handle(MeshEvent::Send(ClipboardEvent::text("hello")))
            .await;
        harness.flush_outbound().await;

        let delivered = harness.connector.channel("p1").sent.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        let envelope = WireEnvelope::decode(&delivered[0]).unwrap();
        assert_eq!(envelope.payload, "hello");
        assert_eq!(envelope.kind, PayloadKind::Text);
        assert!(harness.connector.channel("p2").sent.lock().unwrap().is_empty());

        harness
            .mesh
            .handle(MeshEvent::Send(ClipboardEvent::text("hello")))
            .await;
        assert!(harness.mesh.outbound.is_none(), "repeat content was resent");
    }

    #[tokio::test]
    async fn closed_channel_removes_peer_and_decrements() {
        let mut harness = Harness::new("p0", 1024).await;
        harness.peer_list(&["p0", "p1", "p2"]).await;
        harness.open_channel("p1").await;
        harness.open_channel("p2").await;
        harness.open_channel("p2").await;
        assert_eq!(harness.stats().live_connections, 2);

        harness.connector.sink("p1").emit(PeerEvent::ChannelClosed);
        harness.drain().await;
        assert_eq!(harness.stats().live_connections, 1);
        assert!(!harness.mesh.peers.contains_key("p1"));
    }

    #[tokio::test]
    async fn new_assigned_id_drops_every_peer() {
        let mut harness = Harness::new("p0", 1024).await;
        harness.peer_list(&["p0", "p1"]).await;
        harness.open_channel("p1").await;

        harness
            .mesh
            .handle(MeshEvent::Signal(SignalMessage::AssignedId {
                peer_id: "p0".to_owned(),
            }))
            .await;
        assert_eq!(harness.mesh.peers.len(), 1);

        harness
            .mesh
            .handle(MeshEvent::Signal(SignalMessage::AssignedId {
                peer_id: "p9".to_owned(),
            }))
            .await;
        harness.mesh.publish_stats();
        assert!(harness.mesh.peers.is_empty());
        assert_eq!(harness.stats().live_connections, 0);
    }

    #[tokio::test]
    async fn events_from_retired_links_are_ignored() {
        let mut harness = Harness::new("p0", 1024).await;
        harness.peer_list(&["p0", "p1"]).await;
        let retired = harness.connector.sink("p1");
        harness.peer_list(&["p0"]).await;
        harness.peer_list(&["p0", "p1"]).await;

        retired.emit(PeerEvent::ChannelOpen);
        harness.drain().await;
        assert_eq!(harness.stats().live_connections, 0);
    }

    fn fragments_of(text: &str, fragment_bytes: usize) -> Vec<String> {
        let sealed = PayloadCodec::default()
            .seal(&ClipboardEvent::text(text))
            .unwrap();
        let mut transfer = OutboundTransfer::new(sealed, fragment_bytes).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = transfer.next_frame() {
            frames.push(frame.to_owned());
        }
        frames
    }

    #[tokio::test]
    async fn inbound_fragments_reach_the_clipboard() {
        let mut harness = Harness::new("p0", 1024).await;
        harness.peer_list(&["p0", "p1"]).await;
        harness.open_channel("p1").await;

        let text = "the quick brown fox jumps over the lazy dog";
        let frames = fragments_of(text, 16);
        assert_eq!(frames.len(), 3);

        let sink = harness.connector.sink("p1");
        sink.emit(PeerEvent::ChannelMessage(frames[0].clone()));
        harness.drain().await;
        assert_eq!(
            harness.stats().to_string(),
            "Peers: 1 | Receiving: 1/3"
        );
        assert!(harness.sink.written.lock().unwrap().is_empty());

        for frame in &frames[1..] {
            sink.emit(PeerEvent::ChannelMessage(frame.clone()));
        }
        harness.drain().await;
        assert_eq!(
            *harness.sink.written.lock().unwrap(),
            vec![ClipboardEvent::text(text)]
        );
        assert_eq!(harness.stats().to_string(), "Peers: 1");

        // Echo of what was just applied is not treated as a new change.
        harness
            .mesh
            .handle(MeshEvent::Send(ClipboardEvent::text(text)))
            .await;
        assert!(harness.mesh.outbound.is_none());
    }

    #[tokio::test]
    async fn newer_change_supersedes_unfinished_transfer() {
        let mut harness = Harness::new("p0", 8).await;
        harness.peer_list(&["p0", "p1"]).await;
        harness.open_channel("p1").await;

        harness
            .mesh
            .handle(MeshEvent::Send(ClipboardEvent::text("aaaaaaaaaaaaaaaaaaaaaaaa")))
            .await;
        harness.mesh.pump_fragment().await;
        harness.mesh.publish_stats();
        assert_eq!(harness.stats().to_string(), "Peers: 1 | Sending: 1/3");

        harness
            .mesh
            .handle(MeshEvent::Send(ClipboardEvent::text("bbbbbbbbbbbbbbbb")))
            .await;
        harness.flush_outbound().await;
        assert_eq!(harness.stats().to_string(), "Peers: 1");

        let ids: Vec<(String, usize)> = harness
            .connector
            .channel("p1")
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|frame| {
                let FragmentMetadata { id, index, .. } =
                    WireEnvelope::decode(frame).unwrap().metadata.unwrap();
                (id.to_string(), index)
            })
            .collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0].1, 0);
        assert_ne!(ids[0].0, ids[1].0);
        assert_eq!(ids[1].0, ids[2].0);
        assert_eq!((ids[1].1, ids[2].1), (0, 1));
    }

    #[tokio::test]
    async fn shutdown_tears_everything_down_and_acks() {
        let mut harness = Harness::new("p0", 1024).await;
        harness.peer_list(&["p0", "p1"]).await;
        harness.open_channel("p1").await;

        let (ack_tx, ack_rx) = oneshot::channel();
        harness.mesh.handle(MeshEvent::Shutdown(ack_tx)).await;
        ack_rx.await.unwrap();
        assert!(harness.mesh.peers.is_empty());
        assert!(harness.mesh.my_peer_id.is_none());
        assert!(harness.connector.channel("p1").closed.load(Ordering::SeqCst));
    }
}
