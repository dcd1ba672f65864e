use std::sync::Arc;

use clipcascade_core::ClipboardEvent;
use tracing::info;

use crate::{
    ClientConfig, MeshSession, RelaySession, ServerMode, SessionError, TransportSession,
    collab::{ClipboardSink, Notifier},
    mesh::PeerConnector,
};

/// The session picked at login from the server-reported mode.
#[derive(Clone)]
pub enum ActiveSession {
    Relay(RelaySession),
    Mesh(MeshSession),
}

impl ActiveSession {
    pub fn as_transport(&self) -> &dyn TransportSession {
        match self {
            Self::Relay(session) => session,
            Self::Mesh(session) => session,
        }
    }

    pub fn mode(&self) -> ServerMode {
        match self {
            Self::Relay(_) => ServerMode::Relay,
            Self::Mesh(_) => ServerMode::Mesh,
        }
    }
}

/// Front door for the CLI: owns the active session and routes clipboard
/// changes into it.
#[derive(Clone)]
pub struct SessionSupervisor {
    active: ActiveSession,
}

impl SessionSupervisor {
    pub fn new(active: ActiveSession) -> Self {
        Self { active }
    }

    pub fn from_config(
        config: &ClientConfig,
        sink: Arc<dyn ClipboardSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let active = match config.server_mode {
            ServerMode::Relay => {
                ActiveSession::Relay(RelaySession::from_config(config, sink, notifier)?)
            }
            ServerMode::Mesh => ActiveSession::Mesh(MeshSession::from_config(
                config,
                default_connector(config)?,
                sink,
                notifier,
            )?),
        };
        info!(mode = ?active.mode(), "session created");
        Ok(Self::new(active))
    }

    pub fn active(&self) -> &ActiveSession {
        &self.active
    }

    pub async fn connect(&self) -> Result<(), SessionError> {
        self.active.as_transport().connect().await
    }

    /// Ignored while the session is reconnecting on its own.
    pub async fn manual_reconnect(&self) -> Result<(), SessionError> {
        self.active.as_transport().manual_reconnect().await
    }

    pub async fn disconnect(&self) {
        self.active.as_transport().disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.active.as_transport().is_connected()
    }

    pub fn get_stats(&self) -> String {
        self.active.as_transport().get_stats()
    }

    /// Upper bound in milliseconds between a loss and the end of the next
    /// reconnect attempt.
    pub fn get_total_timeout(&self) -> u64 {
        u64::try_from(self.active.as_transport().get_total_timeout().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn on_clipboard_changed(&self, event: ClipboardEvent) {
        self.active.as_transport().send(event);
    }
}

#[cfg(feature = "webrtc")]
fn default_connector(config: &ClientConfig) -> Result<Arc<dyn PeerConnector>, SessionError> {
    Ok(Arc::new(crate::mesh::WebRtcConnector::new(config.stun_url.clone())?))
}

#[cfg(not(feature = "webrtc"))]
fn default_connector(_config: &ClientConfig) -> Result<Arc<dyn PeerConnector>, SessionError> {
    Err(SessionError::Unsupported(
        "P2P mode needs the `webrtc` feature".to_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mesh::fakes::RecordingSink, session::tests::RecordingNotifier};

    fn config(mode: ServerMode) -> ClientConfig {
        ClientConfig {
            server_mode: mode,
            reconnect_backoff_ms: 10_000,
            connect_timeout_ms: 3_000,
            ..ClientConfig::default()
        }
    }

    fn supervisor(config: &ClientConfig) -> SessionSupervisor {
        SessionSupervisor::from_config(
            config,
            Arc::new(RecordingSink::default()),
            Arc::new(RecordingNotifier::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn relay_mode_selects_relay_session() {
        let supervisor = supervisor(&config(ServerMode::Relay));
        assert_eq!(supervisor.active().mode(), ServerMode::Relay);
        assert_eq!(supervisor.get_stats(), "Relay: disconnected");
        assert_eq!(supervisor.get_total_timeout(), 13_000);
        assert!(!supervisor.is_connected());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = ClientConfig {
            websocket_url: "not a url".to_owned(),
            ..ClientConfig::default()
        };
        let result = SessionSupervisor::from_config(
            &config,
            Arc::new(RecordingSink::default()),
            Arc::new(RecordingNotifier::default()),
        );
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[cfg(feature = "webrtc")]
    #[tokio::test]
    async fn mesh_mode_selects_mesh_session() {
        let supervisor = supervisor(&config(ServerMode::Mesh));
        assert_eq!(supervisor.active().mode(), ServerMode::Mesh);
        assert_eq!(supervisor.get_stats(), "Peers: 0");
    }

    #[tokio::test]
    async fn send_while_disconnected_is_dropped() {
        let supervisor = supervisor(&config(ServerMode::Relay));
        supervisor.on_clipboard_changed(ClipboardEvent::text("hello"));
        supervisor.disconnect().await;
        assert_eq!(supervisor.get_stats(), "Relay: disconnected");
    }
}
