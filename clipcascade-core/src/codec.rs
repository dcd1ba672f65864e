use std::fmt;

use crate::{ClipboardEvent, CoreError, PayloadKind, WireEnvelope, cipher::CipherEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Server,
    Local,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Local => f.write_str("local"),
        }
    }
}

/// Byte caps applied to clipboard content. `None` means uncapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeLimits {
    /// Cap advertised by the server, applied before sending.
    pub server_max: Option<u64>,
    /// Cap configured on this device, applied before accepting inbound data.
    pub local_max: Option<u64>,
}

impl SizeLimits {
    /// Server-side caps are reported as signed values where a negative
    /// number disables the check.
    pub fn from_config(server_max: Option<i64>, local_max: Option<u64>) -> Self {
        Self {
            server_max: server_max.and_then(|value| u64::try_from(value).ok()),
            local_max,
        }
    }

    pub fn check(&self, scope: LimitScope, size: u64) -> Result<(), CoreError> {
        let limit = match scope {
            LimitScope::Server => self.server_max,
            LimitScope::Local => self.local_max,
        };
        match limit {
            Some(limit) if size > limit => Err(CoreError::SizeLimitExceeded { size, limit, scope }),
            _ => Ok(()),
        }
    }
}

/// A clipboard event after size checks and optional encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEvent {
    pub kind: PayloadKind,
    pub payload: String,
    pub raw_size: u64,
}

impl SealedEvent {
    pub fn into_envelope(self) -> WireEnvelope {
        WireEnvelope::new(self.payload, self.kind)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PayloadCodec {
    cipher: Option<CipherEngine>,
    limits: SizeLimits,
}

impl PayloadCodec {
    pub fn new(cipher: Option<CipherEngine>, limits: SizeLimits) -> Self {
        Self { cipher, limits }
    }

    pub fn limits(&self) -> SizeLimits {
        self.limits
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn seal(&self, event: &ClipboardEvent) -> Result<SealedEvent, CoreError> {
        let raw_size = event.size_bytes();
        self.limits.check(LimitScope::Server, raw_size)?;
        let payload = match &self.cipher {
            Some(cipher) => cipher.seal_text(&event.content)?,
            None => event.content.clone(),
        };
        Ok(SealedEvent {
            kind: event.kind,
            payload,
            raw_size,
        })
    }

    pub fn open(&self, payload: &str, kind: PayloadKind) -> Result<ClipboardEvent, CoreError> {
        let content = match &self.cipher {
            Some(cipher) => cipher.open_text(payload)?,
            None => payload.to_owned(),
        };
        self.limits
            .check(LimitScope::Local, content.len() as u64)?;
        Ok(ClipboardEvent::new(kind, content))
    }
}
