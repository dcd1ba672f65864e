use aes_gcm::{
    Aes256Gcm, AesGcm, Key, Nonce, Tag,
    aead::{
        AeadCore, AeadInPlace, KeyInit, OsRng,
        consts::{U12, U16},
    },
    aes::Aes256,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::CoreError;

/// AES-256-GCM with the 16-byte nonce other ClipCascade clients generate.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

const NONCE_LEN: usize = 16;
const SHORT_NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Derives the 32-byte payload key shared by every device of one account.
///
/// The salt is `username || password || extra_salt`, so two accounts with the
/// same password still end up with different keys.
pub fn derive_key(
    password: &str,
    username: &str,
    extra_salt: &str,
    rounds: u32,
) -> Result<[u8; 32], CoreError> {
    if rounds == 0 {
        return Err(CoreError::InvalidHashRounds);
    }
    let salt = format!("{username}{password}{extra_salt}");
    let mut key = [0_u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), rounds, &mut key);
    Ok(key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct EnvelopeJson {
    nonce: String,
    ciphertext: String,
    tag: String,
}

/// Payload cipher. Seals with a fresh 16-byte nonce and no associated data;
/// opens both 16-byte and standard 12-byte nonces.
#[derive(Clone)]
pub struct CipherEngine {
    cipher: Aes256Gcm16,
    short_nonce: Aes256Gcm,
}

impl std::fmt::Debug for CipherEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherEngine").finish_non_exhaustive()
    }
}

impl CipherEngine {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(key)),
            short_nonce: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<SealedPayload, CoreError> {
        let nonce = Aes256Gcm16::generate_nonce(&mut OsRng);
        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, b"", &mut buffer)
            .map_err(|_| CoreError::InvalidEnvelope("encryption failed".to_owned()))?;
        Ok(SealedPayload {
            nonce: nonce.to_vec(),
            ciphertext: buffer,
            tag: tag.to_vec(),
        })
    }

    pub fn decrypt(&self, sealed: &SealedPayload) -> Result<Vec<u8>, CoreError> {
        if sealed.tag.len() != TAG_LEN {
            return Err(CoreError::InvalidEnvelope(format!(
                "tag must be {TAG_LEN} bytes, got {}",
                sealed.tag.len()
            )));
        }

        let mut buffer = sealed.ciphertext.clone();
        let tag = Tag::<U16>::from_slice(&sealed.tag);
        let opened = match sealed.nonce.len() {
            NONCE_LEN => self.cipher.decrypt_in_place_detached(
                Nonce::<U16>::from_slice(&sealed.nonce),
                b"",
                &mut buffer,
                tag,
            ),
            SHORT_NONCE_LEN => self.short_nonce.decrypt_in_place_detached(
                Nonce::<U12>::from_slice(&sealed.nonce),
                b"",
                &mut buffer,
                tag,
            ),
            other => {
                return Err(CoreError::InvalidEnvelope(format!(
                    "nonce must be {NONCE_LEN} or {SHORT_NONCE_LEN} bytes, got {other}"
                )));
            }
        };
        opened.map_err(|_| CoreError::Authentication)?;
        Ok(buffer)
    }

    /// Encrypts UTF-8 text straight into its JSON wire envelope.
    pub fn seal_text(&self, plaintext: &str) -> Result<String, CoreError> {
        encode_envelope(&self.encrypt(plaintext.as_bytes())?)
    }

    pub fn open_text(&self, envelope: &str) -> Result<String, CoreError> {
        let plaintext = self.decrypt(&decode_envelope(envelope)?)?;
        String::from_utf8(plaintext)
            .map_err(|err| CoreError::InvalidEnvelope(format!("plaintext is not UTF-8: {err}")))
    }
}

pub fn encode_envelope(sealed: &SealedPayload) -> Result<String, CoreError> {
    let json = EnvelopeJson {
        nonce: BASE64.encode(&sealed.nonce),
        ciphertext: BASE64.encode(&sealed.ciphertext),
        tag: BASE64.encode(&sealed.tag),
    };
    Ok(serde_json::to_string(&json)?)
}

pub fn decode_envelope(raw: &str) -> Result<SealedPayload, CoreError> {
    let json: EnvelopeJson =
        serde_json::from_str(raw).map_err(|err| CoreError::InvalidEnvelope(err.to_string()))?;
    let field = |name: &str, value: &str| {
        BASE64
            .decode(value)
            .map_err(|err| CoreError::InvalidEnvelope(format!("{name}: {err}")))
    };
    Ok(SealedPayload {
        nonce: field("nonce", &json.nonce)?,
        ciphertext: field("ciphertext", &json.ciphertext)?,
        tag: field("tag", &json.tag)?,
    })
}
