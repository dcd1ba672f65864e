use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    #[default]
    Text,
    Image,
    Files,
}

impl PayloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Files => "files",
        }
    }
}

/// One clipboard change as produced by a collector or applied by a writer.
///
/// Image and file content travel as their base64/JSON text form, so every
/// kind is carried as a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardEvent {
    pub kind: PayloadKind,
    pub content: String,
}

impl ClipboardEvent {
    pub fn new(kind: PayloadKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(PayloadKind::Text, content)
    }

    pub fn size_bytes(&self) -> u64 {
        self.content.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentMetadata {
    pub id: Uuid,
    pub is_fragmented: bool,
    pub index: usize,
    pub total_fragments: usize,
    pub combined_raw_payload_size_in_bytes: u64,
}

/// JSON message carried by both transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub payload: String,
    #[serde(rename = "type", default)]
    pub kind: PayloadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FragmentMetadata>,
}

impl WireEnvelope {
    pub fn new(payload: impl Into<String>, kind: PayloadKind) -> Self {
        Self {
            payload: payload.into(),
            kind,
            metadata: None,
        }
    }

    pub fn encode(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_envelope_omits_metadata() {
        let envelope = WireEnvelope::new("hello", PayloadKind::Text);
        let json: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"payload": "hello", "type": "text"}));
    }

    #[test]
    fn fragment_metadata_uses_camel_case_names() {
        let id = Uuid::new_v4();
        let envelope = WireEnvelope {
            payload: "part".to_owned(),
            kind: PayloadKind::Image,
            metadata: Some(FragmentMetadata {
                id,
                is_fragmented: true,
                index: 2,
                total_fragments: 5,
                combined_raw_payload_size_in_bytes: 70_000,
            }),
        };
        let json: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["metadata"]["id"], id.to_string());
        assert_eq!(json["metadata"]["isFragmented"], true);
        assert_eq!(json["metadata"]["totalFragments"], 5);
        assert_eq!(json["metadata"]["combinedRawPayloadSizeInBytes"], 70_000);
        assert_eq!(WireEnvelope::decode(&envelope.encode().unwrap()).unwrap(), envelope);
    }

    #[test]
    fn missing_type_defaults_to_text() {
        let envelope = WireEnvelope::decode(r#"{"payload":"x"}"#).unwrap();
        assert_eq!(envelope.kind, PayloadKind::Text);
        assert!(envelope.metadata.is_none());
    }
}
