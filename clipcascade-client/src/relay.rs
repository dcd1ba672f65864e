use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use clipcascade_core::{ClipboardEvent, CoreError, PayloadCodec, StompFrame, WireEnvelope};
use futures::StreamExt;
use tokio::{
    task::{AbortHandle, JoinHandle},
    time::{Instant, timeout_at},
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    ClientConfig, ConfigError, SessionError,
    collab::{ClipboardSink, Notifier},
    session::{ReconnectPolicy, SessionShared, TransportSession, reconnect_until_restored},
    transport::{Keepalive, WsRead, open_socket, spawn_writer},
};

const SUBSCRIPTION_ID: &str = "sub-0";

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub url: String,
    pub cookie: Option<String>,
    pub subscription_destination: String,
    pub send_destination: String,
    pub policy: ReconnectPolicy,
}

impl RelaySettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            url: config.websocket_url.clone(),
            cookie: config.cookie.clone(),
            subscription_destination: config.subscription_destination.clone(),
            send_destination: config.send_destination.clone(),
            policy: ReconnectPolicy {
                backoff: config.reconnect_backoff(),
                connect_timeout: config.connect_timeout(),
            },
        }
    }

    fn host(&self) -> String {
        Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_else(|| "localhost".to_owned())
    }
}

struct RelayLink {
    outbound: tokio::sync::mpsc::UnboundedSender<String>,
    reader: AbortHandle,
}

struct RelayInner {
    settings: RelaySettings,
    shared: SessionShared,
    codec: PayloadCodec,
    sink: Arc<dyn ClipboardSink>,
    notifier: Arc<dyn Notifier>,
    link: Mutex<Option<RelayLink>>,
}

/// Clipboard sync through a STOMP broker over one WebSocket.
#[derive(Clone)]
pub struct RelaySession {
    inner: Arc<RelayInner>,
}

impl RelaySession {
    pub fn new(
        settings: RelaySettings,
        codec: PayloadCodec,
        sink: Arc<dyn ClipboardSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                settings,
                shared: SessionShared::new(),
                codec,
                sink,
                notifier,
                link: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(
        config: &ClientConfig,
        sink: Arc<dyn ClipboardSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            RelaySettings::from_config(config),
            config.payload_codec()?,
            sink,
            notifier,
        ))
    }
}

impl RelayInner {
    fn install_link(&self, link: Option<RelayLink>) -> Option<RelayLink> {
        let mut guard = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, link)
    }

    async fn establish(self: &Arc<Self>, epoch: u64) -> Result<JoinHandle<()>, SessionError> {
        let timeout = self.settings.policy.connect_timeout;
        let deadline = Instant::now() + timeout;
        let url = &self.settings.url;
        info!(url = %url, "connecting to relay");

        let stream = open_socket(url, self.settings.cookie.as_deref(), deadline, timeout).await?;
        let (write, mut read) = stream.split();
        let (outbound, writer) = spawn_writer(write, Keepalive::StompHeartbeat);

        let _ = outbound.send(StompFrame::connect(&self.settings.host()).encode());
        if let Err(err) = await_connected(&mut read, deadline, url, timeout).await {
            writer.abort();
            return Err(err);
        }

        if self.shared.epoch() != epoch || self.shared.is_user_disconnected() {
            drop(outbound);
            return Err(SessionError::Cancelled);
        }

        let _ = outbound.send(
            StompFrame::subscribe(SUBSCRIPTION_ID, &self.settings.subscription_destination)
                .encode(),
        );

        let reader = tokio::spawn(read_loop(self.clone(), read));
        if let Some(stale) = self.install_link(Some(RelayLink {
            outbound,
            reader: reader.abort_handle(),
        })) {
            stale.reader.abort();
        }
        self.shared.mark_connected(self.notifier.as_ref());
        info!(url = %url, "relay connected");
        Ok(reader)
    }

    fn receive(&self, body: &str) {
        let envelope = match WireEnvelope::decode(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dropping malformed relay message: {}", err);
                return;
            }
        };

        let event = match self.codec.open(&envelope.payload, envelope.kind) {
            Ok(event) => event,
            Err(err @ (CoreError::Authentication | CoreError::InvalidEnvelope(_))) => {
                warn!(
                    "dropping undecryptable payload ({}); check that encryption is set up the same on every device",
                    err
                );
                return;
            }
            Err(err) => {
                warn!("dropping inbound payload: {}", err);
                return;
            }
        };

        if !self.shared.has_changed(&event.content) {
            debug!("inbound payload matches current clipboard");
            return;
        }
        if let Err(err) = self.sink.write_clipboard(event) {
            warn!("failed to apply inbound clipboard: {}", err);
        }
    }

    fn publish(&self, event: ClipboardEvent) {
        if !self.shared.is_connected() {
            debug!("not connected, clipboard change not sent");
            return;
        }
        if !self.shared.has_changed(&event.content) {
            return;
        }

        let body = match self
            .codec
            .seal(&event)
            .and_then(|sealed| sealed.into_envelope().encode())
        {
            Ok(body) => body,
            Err(err) => {
                warn!("clipboard change not sent: {}", err);
                return;
            }
        };
        let frame = StompFrame::send(&self.settings.send_destination, body).encode();

        let guard = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(link) if link.outbound.send(frame).is_ok() => {
                debug!(kind = event.kind.as_str(), "clipboard change queued");
            }
            _ => warn!("relay link is gone, clipboard change dropped"),
        }
    }
}

async fn await_connected(
    read: &mut WsRead,
    deadline: Instant,
    url: &str,
    timeout: Duration,
) -> Result<(), SessionError> {
    timeout_at(deadline, read_connected(read))
        .await
        .map_err(|_| SessionError::ConnectTimeout {
            url: url.to_owned(),
            timeout,
        })?
}

async fn read_connected(read: &mut WsRead) -> Result<(), SessionError> {
    while let Some(next) = read.next().await {
        let text = match next.map_err(|err| SessionError::Transport(err.to_string()))? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Some(frame) = StompFrame::decode(text.as_str())? else {
            continue;
        };
        match frame.command.as_str() {
            "CONNECTED" => return Ok(()),
            "ERROR" => {
                return Err(SessionError::Broker(
                    frame
                        .get("message")
                        .unwrap_or(frame.body.as_str())
                        .to_owned(),
                ));
            }
            other => debug!("ignoring {} before CONNECTED", other),
        }
    }
    Err(SessionError::Transport(
        "socket closed before CONNECTED".to_owned(),
    ))
}

async fn read_loop(inner: Arc<RelayInner>, mut read: WsRead) {
    while let Some(next) = read.next().await {
        let text = match next {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!("relay receive error: {}", err);
                break;
            }
        };

        match StompFrame::decode(text.as_str()) {
            Ok(Some(frame)) if frame.command == "MESSAGE" => inner.receive(&frame.body),
            Ok(Some(frame)) if frame.command == "ERROR" => {
                warn!(
                    "broker error: {}",
                    frame.get("message").unwrap_or(frame.body.as_str())
                );
            }
            Ok(Some(frame)) => debug!("ignoring {} frame", frame.command),
            Ok(None) => {}
            Err(err) => warn!("dropping malformed frame: {}", err),
        }
    }
}

/// Waits for the reader of the current connection to end and runs the
/// reconnect loop, for as long as the session's disconnect epoch holds.
async fn drive(inner: Arc<RelayInner>, epoch: u64, mut reader: JoinHandle<()>) {
    loop {
        let _ = reader.await;
        if inner.shared.epoch() != epoch {
            return;
        }
        inner.install_link(None);
        info!("relay connection lost");

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
impl TransportSession for RelaySession {
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
        let epoch = self.inner.shared.epoch();
        let reader = self.inner.establish(epoch).await?;
        tokio::spawn(drive(self.inner.clone(), epoch, reader));
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.shared.mark_user_disconnect();
        if let Some(link) = self.inner.install_link(None) {
            let _ = link.outbound.send(StompFrame::disconnect().encode());
            link.reader.abort();
        }
        info!("relay disconnected by user");
    }

    fn send(&self, event: ClipboardEvent) {
        self.inner.publish(event);
    }

    fn get_stats(&self) -> String {
        let flags = self.inner.shared.flags();
        if flags.connected {
            "Relay: connected".to_owned()
        } else if flags.auto_reconnecting {
            "Relay: reconnecting".to_owned()
        } else {
            "Relay: disconnected".to_owned()
        }
    }
}
