pub mod change;
pub mod cipher;
pub mod codec;
pub mod envelope;
pub mod fragment;
pub mod ice;
pub mod signaling;
pub mod stomp;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use change::{ChangeDetector, content_hash};
pub use cipher::{CipherEngine, SealedPayload, decode_envelope, derive_key, encode_envelope};
pub use codec::{LimitScope, PayloadCodec, SealedEvent, SizeLimits};
pub use envelope::{ClipboardEvent, FragmentMetadata, PayloadKind, WireEnvelope};
pub use fragment::{OutboundTransfer, Reassembler, Reassembly, split_utf8};
pub use ice::IceCandidateLine;
pub use signaling::{CandidateInit, PeerId, SessionDescription, SignalMessage};
pub use stomp::StompFrame;

pub const DEFAULT_HASH_ROUNDS: u32 = 664_937;
pub const DEFAULT_FRAGMENT_BYTES: usize = 15 * 1024;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_PEERS_PER_ROOM: usize = 10;
pub const SUBSCRIPTION_DESTINATION: &str = "/topic/cliptext";
pub const SEND_DESTINATION: &str = "/app/cliptext";
pub const DATA_CHANNEL_LABEL: &str = "cliptext";
pub const RELAY_PATH: &str = "/clipsocket";
pub const SIGNALING_PATH: &str = "/p2psignaling";

pub type RoomId = String;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("payload authentication failed (cipher settings or password differ between devices)")]
    Authentication,
    #[error("{scope} size limit exceeded: {size} bytes > {limit} bytes")]
    SizeLimitExceeded {
        size: u64,
        limit: u64,
        scope: LimitScope,
    },
    #[error("transfer {transfer_id} aborted: missing fragments {missing:?}")]
    Fragmentation {
        transfer_id: String,
        missing: Vec<usize>,
    },
    #[error("invalid fragment metadata: {0}")]
    InvalidFragment(String),
    #[error("signaling protocol error: {0}")]
    SignalingProtocol(String),
    #[error("invalid cipher envelope: {0}")]
    InvalidEnvelope(String),
    #[error("invalid STOMP frame: {0}")]
    InvalidStompFrame(String),
    #[error("hash rounds must be at least 1")]
    InvalidHashRounds,
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Room identifier for a login session, derived from its session cookie.
pub fn room_id_from_cookie(cookie: &str) -> RoomId {
    let digest = Sha256::digest(cookie.trim().as_bytes());
    hex::encode(digest)
}
