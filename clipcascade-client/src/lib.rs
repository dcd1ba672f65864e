pub mod clipboard;
pub mod collab;
pub mod config;
pub mod logging;
pub mod mesh;
pub mod relay;
pub mod session;
pub mod supervisor;
mod transport;

use std::time::Duration;

use clipcascade_core::CoreError;
use thiserror::Error;

pub use collab::{ClipboardSink, Notifier, TracingNotifier};
pub use config::{ClientConfig, ConfigError, ServerMode};
pub use mesh::MeshSession;
pub use relay::RelaySession;
pub use session::{ReconnectPolicy, SessionFlags, SessionShared, TransportSession};
pub use supervisor::{ActiveSession, SessionSupervisor};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("broker rejected the connection: {0}")]
    Broker(String),
    #[error("connect cancelled by user disconnect")]
    Cancelled,
    #[error("peer connection error: {0}")]
    Peer(String),
    #[error("{0}")]
    Unsupported(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Core(#[from] CoreError),
}
