use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clipcascade_core::{
    CipherEngine, CoreError, DEFAULT_FRAGMENT_BYTES, DEFAULT_HASH_ROUNDS, PayloadCodec,
    SEND_DESTINATION, SUBSCRIPTION_DESTINATION, SizeLimits, derive_key,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const MAX_URL_LEN: usize = 2048;
const SAVE_ATTEMPTS: u32 = 3;
const SAVE_BACKOFF_BASE_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write config file {path}: {message}")]
    Write { path: PathBuf, message: String },
    #[error("invalid configuration:\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
}

/// Transport reported by the server at login.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMode {
    #[default]
    #[serde(rename = "P2S")]
    Relay,
    #[serde(rename = "P2P")]
    Mesh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    /// Broker endpoint in relay mode, signaling endpoint in mesh mode.
    pub websocket_url: String,
    pub cipher_enabled: bool,
    pub hash_rounds: u32,
    pub salt: String,
    pub username: String,
    /// Derived payload key, persisted as base64.
    #[serde(with = "optional_base64")]
    pub hashed_password: Option<Vec<u8>>,
    pub cookie: Option<String>,
    pub maxsize: Option<i64>,
    pub max_clipboard_size_local_limit_bytes: Option<u64>,
    pub stun_url: String,
    pub server_mode: ServerMode,
    pub subscription_destination: String,
    pub send_destination: String,
    pub notification: bool,
    pub reconnect_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    pub fragment_size_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_owned(),
            websocket_url: "ws://localhost:8080/clipsocket".to_owned(),
            cipher_enabled: false,
            hash_rounds: DEFAULT_HASH_ROUNDS,
            salt: String::new(),
            username: String::new(),
            hashed_password: None,
            cookie: None,
            maxsize: None,
            max_clipboard_size_local_limit_bytes: None,
            stun_url: "stun:stun.l.google.com:19302".to_owned(),
            server_mode: ServerMode::Relay,
            subscription_destination: SUBSCRIPTION_DESTINATION.to_owned(),
            send_destination: SEND_DESTINATION.to_owned(),
            notification: true,
            reconnect_backoff_ms: 10_000,
            connect_timeout_ms: 3_000,
            fragment_size_bytes: DEFAULT_FRAGMENT_BYTES,
        }
    }
}

mod optional_base64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|text| BASE64.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

fn check_url(errors: &mut Vec<String>, label: &str, raw: &str, schemes: &[&str]) {
    let raw = raw.trim();
    if raw.is_empty() {
        errors.push(format!("{label} is required."));
        return;
    }
    if raw.len() > MAX_URL_LEN {
        errors.push(format!(
            "{label} is too long ({} > {MAX_URL_LEN} chars).",
            raw.len()
        ));
        return;
    }
    match Url::parse(raw) {
        Ok(url) if schemes.contains(&url.scheme()) => {}
        Ok(url) => errors.push(format!(
            "{label} must use one of {schemes:?}, got {}://",
            url.scheme()
        )),
        Err(err) => errors.push(format!("{label} is invalid: {err}")),
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        check_url(&mut errors, "Server URL", &self.server_url, &["http", "https"]);
        check_url(&mut errors, "WebSocket URL", &self.websocket_url, &["ws", "wss"]);

        if self.hash_rounds == 0 {
            errors.push("Hash rounds must be at least 1.".to_owned());
        }
        if self.reconnect_backoff_ms == 0 {
            errors.push("Reconnect backoff must be greater than zero.".to_owned());
        }
        if self.connect_timeout_ms == 0 {
            errors.push("Connect timeout must be greater than zero.".to_owned());
        }
        if self.fragment_size_bytes == 0 {
            errors.push("Fragment size must be greater than zero.".to_owned());
        }
        if let Some(key) = &self.hashed_password
            && key.len() != 32
        {
            errors.push(format!("Stored key must be 32 bytes, found {}.", key.len()));
        }
        if self.server_mode == ServerMode::Mesh && self.stun_url.trim().is_empty() {
            errors.push("STUN URL is required in P2P mode.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn key(&self) -> Option<[u8; 32]> {
        self.hashed_password
            .as_deref()
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
    }

    pub fn derive_and_store_key(&mut self, password: &str) -> Result<(), CoreError> {
        let key = derive_key(password, &self.username, &self.salt, self.hash_rounds)?;
        self.hashed_password = Some(key.to_vec());
        Ok(())
    }

    /// Mesh mode has no server-side message cap.
    pub fn size_limits(&self) -> SizeLimits {
        let server_max = match self.server_mode {
            ServerMode::Relay => self.maxsize,
            ServerMode::Mesh => Some(-1),
        };
        SizeLimits::from_config(server_max, self.max_clipboard_size_local_limit_bytes)
    }

    pub fn payload_codec(&self) -> Result<PayloadCodec, ConfigError> {
        let cipher = if self.cipher_enabled {
            let key = self.key().ok_or_else(|| {
                ConfigError::Invalid(vec![
                    "Encryption is enabled but no key has been derived.".to_owned(),
                ])
            })?;
            Some(CipherEngine::new(&key))
        } else {
            None
        };
        Ok(PayloadCodec::new(cipher, self.size_limits()))
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Writes through a temporary file and renames it into place, retrying
    /// briefly when another process holds the file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;

        let write_error = |message: String| ConfigError::Write {
            path: path.to_owned(),
            message,
        };
        let payload = serde_json::to_string_pretty(self).map_err(|err| write_error(err.to_string()))?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| write_error(err.to_string()))?;
        }
        let tmp_path = path.with_extension("json.tmp");

        let mut attempt = 1;
        loop {
            let result = std::fs::write(&tmp_path, payload.as_bytes())
                .map_err(|err| format!("failed to write {}: {err}", tmp_path.display()))
                .and_then(|()| {
                    std::fs::rename(&tmp_path, path)
                        .map_err(|err| format!("failed to move config into place: {err}"))
                });
            match result {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= SAVE_ATTEMPTS => return Err(write_error(err)),
                Err(_) => {
                    let backoff_ms = SAVE_BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                    attempt += 1;
                }
            }
        }
    }
}

pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("CLIPCASCADE_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".clipcascade"))
        .unwrap_or_else(|| PathBuf::from(".clipcascade"))
}

pub fn default_config_path() -> PathBuf {
    data_dir().join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.hash_rounds, 664_937);
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(10));
        assert_eq!(config.connect_timeout(), Duration::from_millis(3_000));
    }

    #[test]
    fn validation_collects_every_problem() {
        let config = ClientConfig {
            server_url: "ftp://example.com".to_owned(),
            websocket_url: "http://example.com/clipsocket".to_owned(),
            hash_rounds: 0,
            hashed_password: Some(vec![1, 2, 3]),
            ..ClientConfig::default()
        };
        match config.validate() {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn server_mode_uses_login_names() {
        assert_eq!(serde_json::to_string(&ServerMode::Relay).unwrap(), "\"P2S\"");
        assert_eq!(serde_json::to_string(&ServerMode::Mesh).unwrap(), "\"P2P\"");
    }

    #[test]
    fn mesh_mode_ignores_server_cap() {
        let config = ClientConfig {
            server_mode: ServerMode::Mesh,
            maxsize: Some(10),
            max_clipboard_size_local_limit_bytes: Some(20),
            ..ClientConfig::default()
        };
        let limits = config.size_limits();
        assert_eq!(limits.server_max, None);
        assert_eq!(limits.local_max, Some(20));
    }

    #[test]
    fn cipher_without_key_is_rejected() {
        let mut config = ClientConfig {
            cipher_enabled: true,
            hash_rounds: 5,
            username: "alice".to_owned(),
            ..ClientConfig::default()
        };
        assert!(matches!(config.payload_codec(), Err(ConfigError::Invalid(_))));
        config.derive_and_store_key("hunter2").unwrap();
        assert!(config.key().is_some());
        assert!(config.payload_codec().unwrap().is_encrypted());
    }
}
