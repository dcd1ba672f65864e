//! P2P mode: a signaling WebSocket plus one data channel per peer.

mod executor;
mod peer;
#[cfg(feature = "webrtc")]
mod rtc;

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use clipcascade_core::{ClipboardEvent, PayloadCodec, SignalMessage};
use futures::StreamExt;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::{AbortHandle, JoinHandle},
    time::{Instant, timeout, timeout_at},
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub use executor::MeshStats;
pub use peer::{DataChannel, PeerConnector, PeerEvent, PeerEventSink, PeerLink};
#[cfg(feature = "webrtc")]
pub use rtc::WebRtcConnector;

#[cfg(test)]
pub(crate) use executor::tests as fakes;

use self::executor::{MeshEvent, MeshParts, PeerMesh};
use crate::{
    ClientConfig, ConfigError, SessionError,
    collab::{ClipboardSink, Notifier},
    session::{ReconnectPolicy, SessionShared, TransportSession, reconnect_until_restored},
    transport::{Keepalive, WsRead, open_socket, spawn_writer},
};

#[derive(Debug, Clone)]
pub struct MeshSettings {
    pub url: String,
    pub cookie: Option<String>,
    pub fragment_bytes: usize,
    pub policy: ReconnectPolicy,
}

impl MeshSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            url: config.websocket_url.clone(),
            cookie: config.cookie.clone(),
            fragment_bytes: config.fragment_size_bytes,
            policy: ReconnectPolicy {
                backoff: config.reconnect_backoff(),
                connect_timeout: config.connect_timeout(),
            },
        }
    }
}

struct SignalingLink {
    outbound: UnboundedSender<String>,
    reader: AbortHandle,
}

struct MeshInner {
    settings: MeshSettings,
    shared: Arc<SessionShared>,
    notifier: Arc<dyn Notifier>,
    events: UnboundedSender<MeshEvent>,
    stats: Arc<Mutex<MeshStats>>,
    // Taken and spawned by the first connect.
    executor: Mutex<Option<(PeerMesh, UnboundedReceiver<MeshEvent>)>>,
    link: Mutex<Option<SignalingLink>>,
}

/// Clipboard sync over direct peer data channels negotiated through a
/// signaling server.
#[derive(Clone)]
pub struct MeshSession {
    inner: Arc<MeshInner>,
}

impl MeshSession {
    pub fn new(
        settings: MeshSettings,
        codec: PayloadCodec,
        connector: Arc<dyn PeerConnector>,
        sink: Arc<dyn ClipboardSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared::new());
        let stats = Arc::new(Mutex::new(MeshStats::default()));
        let mesh = PeerMesh::new(MeshParts {
            connector,
            events: events.clone(),
            shared: shared.clone(),
            codec,
            sink,
            stats: stats.clone(),
            fragment_bytes: settings.fragment_bytes,
        });
        Self {
            inner: Arc::new(MeshInner {
                settings,
                shared,
                notifier,
                events,
                stats,
                executor: Mutex::new(Some((mesh, receiver))),
                link: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(
        config: &ClientConfig,
        connector: Arc<dyn PeerConnector>,
        sink: Arc<dyn ClipboardSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            MeshSettings::from_config(config),
            config.payload_codec()?,
            connector,
            sink,
            notifier,
        ))
    }

    pub fn stats(&self) -> MeshStats {
        *self
            .inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl MeshInner {
    fn install_link(&self, link: Option<SignalingLink>) -> Option<SignalingLink> {
        let mut guard = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, link)
    }

    fn ensure_executor(&self) {
        let pending = self
            .executor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((mesh, receiver)) = pending {
            tokio::spawn(mesh.run(receiver));
        }
    }

    fn executor_started(&self) -> bool {
        self.executor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    async fn establish(self: &Arc<Self>, epoch: u64) -> Result<JoinHandle<()>, SessionError> {
        let timeout = self.settings.policy.connect_timeout;
        let deadline = Instant::now() + timeout;
        let url = &self.settings.url;
        info!(url = %url, "connecting to signaling server");

        let stream = open_socket(url, self.settings.cookie.as_deref(), deadline, timeout).await?;
        let (write, mut read) = stream.split();
        let peer_id = await_assigned_id(&mut read, deadline, url, timeout).await?;

        if self.shared.epoch() != epoch || self.shared.is_user_disconnected() {
            return Err(SessionError::Cancelled);
        }

        let (outbound, _writer) = spawn_writer(write, Keepalive::Ping);
        let _ = self.events.send(MeshEvent::SignalingUp {
            outbox: outbound.clone(),
        });
        let _ = self
            .events
            .send(MeshEvent::Signal(SignalMessage::AssignedId {
                peer_id: peer_id.clone(),
            }));

        let reader = tokio::spawn(read_loop(self.events.clone(), read));
        if let Some(stale) = self.install_link(Some(SignalingLink {
            outbound,
            reader: reader.abort_handle(),
        })) {
            stale.reader.abort();
        }
        self.shared.mark_connected(self.notifier.as_ref());
        info!(peer_id = %peer_id, "signaling connected");
        Ok(reader)
    }
}

/// The server acknowledges a signaling connection by assigning a peer id.
async fn await_assigned_id(
    read: &mut WsRead,
    deadline: Instant,
    url: &str,
    timeout: Duration,
) -> Result<String, SessionError> {
    timeout_at(deadline, read_assigned_id(read))
        .await
        .map_err(|_| SessionError::ConnectTimeout {
            url: url.to_owned(),
            timeout,
        })?
}

async fn read_assigned_id(read: &mut WsRead) -> Result<String, SessionError> {
    while let Some(next) = read.next().await {
        let text = match next.map_err(|err| SessionError::Transport(err.to_string()))? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match SignalMessage::decode(text.as_str())? {
            SignalMessage::AssignedId { peer_id } => return Ok(peer_id),
            other => debug!(?other, "ignoring signal before ASSIGNED_ID"),
        }
    }
    Err(SessionError::Transport(
        "socket closed before ASSIGNED_ID".to_owned(),
    ))
}

async fn read_loop(events: UnboundedSender<MeshEvent>, mut read: WsRead) {
    while let Some(next) = read.next().await {
        let text = match next {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!("signaling receive error: {}", err);
                break;
            }
        };
        match SignalMessage::decode(text.as_str()) {
            Ok(signal) => {
                if events.send(MeshEvent::Signal(signal)).is_err() {
                    return;
                }
            }
            Err(err) => warn!("dropping signaling message: {}", err),
        }
    }
    let _ = events.send(MeshEvent::SignalingDown);
}

async fn drive(inner: Arc<MeshInner>, epoch: u64, mut reader: JoinHandle<()>) {
    loop {
        let _ = reader.await;
        if inner.shared.epoch() != epoch {
            return;
        }
        inner.install_link(None);
        info!("signaling connection lost");

        let retry = inner.clone();
        let restored = reconnect_until_restored(
            &inner.shared,
            inner.notifier.as_ref(),
            inner.settings.policy.backoff,
            epoch,
            move || {
                let inner = retry.clone();
                async move { inner.establish(epoch).await }
            },
        )
        .await;

        match restored {
            Some(next) => reader = next,
            None => return,
        }
    }
}

#[async_trait]
impl TransportSession for MeshSession {
    fn shared(&self) -> &SessionShared {
        &self.inner.shared
    }

    fn policy(&self) -> ReconnectPolicy {
        self.inner.settings.policy
    }

    async fn connect(&self) -> Result<(), SessionError> {
        if self.inner.shared.is_connected() || !self.inner.shared.begin_manual_reconnect() {
            return Ok(());
        }
        self.inner.ensure_executor();
        let epoch = self.inner.shared.epoch();
        let reader = self.inner.establish(epoch).await?;
        tokio::spawn(drive(self.inner.clone(), epoch, reader));
        Ok(())
    }

    /// Tears down every peer before the signaling socket closes.
    async fn disconnect(&self) {
        self.inner.shared.mark_user_disconnect();

        if self.inner.executor_started() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if self.inner.events.send(MeshEvent::Shutdown(ack_tx)).is_ok()
                && timeout(self.inner.settings.policy.connect_timeout, ack_rx)
                    .await
                    .is_err()
            {
                warn!("peer teardown did not finish in time");
            }
        }

        if let Some(link) = self.inner.install_link(None) {
            drop(link.outbound);
            link.reader.abort();
        }
        info!("mesh disconnected by user");
    }

    fn send(&self, event: ClipboardEvent) {
        if self.inner.events.send(MeshEvent::Send(event)).is_err() {
            warn!("mesh executor is gone, clipboard change dropped");
        }
    }

    fn get_stats(&self) -> String {
        self.stats().to_string()
    }
}
