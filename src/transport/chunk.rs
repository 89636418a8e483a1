// src/transport/chunk.rs

//! Wire shape of one trace chunk.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, EncryptedPayload, SessionKey};
use crate::errors::{RelayError, Result};
use crate::trace::{CompactedStep, TraceMetadata};

/// Steps of a chunk, either in the clear or sealed with the session key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkPayload {
    Encrypted(EncryptedPayload),
    Plain { steps: Vec<CompactedStep> },
}

/// `{chunkId, totalChunks, steps | (iv, encryptedData, authTag), metadata?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub chunk_id: usize,
    pub total_chunks: usize,
    #[serde(flatten)]
    pub payload: ChunkPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TraceMetadata>,
}

/// Associated data binding a ciphertext to its position in the trace.
pub fn chunk_aad(chunk_id: usize) -> Vec<u8> {
    format!("chunk:{chunk_id}").into_bytes()
}

impl Chunk {
    pub fn is_encrypted(&self) -> bool {
        matches!(self.payload, ChunkPayload::Encrypted(_))
    }

    /// Seal the steps with `key`. Already sealed chunks are returned as is.
    pub fn encrypt(self, key: &SessionKey) -> Result<Chunk> {
        let steps = match self.payload {
            ChunkPayload::Plain { steps } => steps,
            ChunkPayload::Encrypted(_) => return Ok(self),
        };
        let plaintext = serde_json::to_vec(&steps)?;
        let sealed = crypto::encrypt(&plaintext, &chunk_aad(self.chunk_id), key)?;
        Ok(Chunk {
            payload: ChunkPayload::Encrypted(sealed),
            ..self
        })
    }

    /// Compacted steps of this chunk, decrypting with `key` when sealed.
    pub fn open(&self, key: Option<&SessionKey>) -> Result<Vec<CompactedStep>> {
        match &self.payload {
            ChunkPayload::Plain { steps } => Ok(steps.clone()),
            ChunkPayload::Encrypted(sealed) => {
                let key = key.ok_or(RelayError::DecryptionError)?;
                let plaintext = crypto::decrypt(sealed, &chunk_aad(self.chunk_id), key)?;
                serde_json::from_slice(&plaintext).map_err(|e| RelayError::MalformedChunk {
                    chunk_id: self.chunk_id,
                    reason: format!("decrypted steps are not valid JSON: {e}"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoHelper;
    use serde_json::json;

    fn plain(chunk_id: usize) -> Chunk {
        Chunk {
            chunk_id,
            total_chunks: 3,
            payload: ChunkPayload::Plain { steps: Vec::new() },
            metadata: None,
        }
    }

    #[test]
    fn wire_shapes() {
        let value = serde_json::to_value(plain(1)).unwrap();
        assert_eq!(value, json!({"chunkId": 1, "totalChunks": 3, "steps": []}));

        let key = CryptoHelper::new("s3cret").derive_key("sess");
        let sealed = plain(1).encrypt(&key).unwrap();
        let value = serde_json::to_value(&sealed).unwrap();
        assert!(value.get("steps").is_none());
        assert!(value.get("iv").is_some());
        assert!(value.get("encryptedData").is_some());
        assert!(value.get("authTag").is_some());

        let back: Chunk = serde_json::from_value(value).unwrap();
        assert!(back.is_encrypted());
        assert_eq!(back.open(Some(&key)).unwrap(), Vec::new());
    }

    #[test]
    fn ciphertext_is_bound_to_chunk_id() {
        let key = CryptoHelper::new("s3cret").derive_key("sess");
        let mut sealed = plain(0).encrypt(&key).unwrap();
        sealed.chunk_id = 2;
        assert!(matches!(sealed.open(Some(&key)), Err(RelayError::DecryptionError)));
    }

    #[test]
    fn sealed_chunk_without_key_fails() {
        let key = CryptoHelper::new("s3cret").derive_key("sess");
        let sealed = plain(0).encrypt(&key).unwrap();
        assert!(matches!(sealed.open(None), Err(RelayError::DecryptionError)));
    }
}
