//! Processor output.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Result produced by a processor on success.
///
/// Binary data is carried as base64 on the wire so job records stay
/// JSON-encodable inside the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutput {
    Json {
        value: serde_json::Value,
    },
    Binary {
        content_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl JobOutput {
    pub fn json(value: serde_json::Value) -> Self {
        Self::Json { value }
    }

    pub fn binary(content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self::Binary {
            content_type: content_type.into(),
            data,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json { value } => Some(value),
            Self::Binary { .. } => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary { data, .. } => Some(data),
            Self::Json { .. } => None,
        }
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
