// src/transport/server.rs

//! Server side of chunk delivery: partitioning and serving by id.

use tracing::debug;

use crate::crypto::SessionKey;
use crate::errors::{RelayError, Result};
use crate::trace::{CompactedStep, TraceMetadata};
use crate::transport::chunk::{Chunk, ChunkPayload};

/// Split `steps` into `ceil(N / chunk_size)` ordered chunks.
///
/// Only chunk 0 carries `metadata`. An empty trace still yields one (empty)
/// chunk so the client always learns `totalChunks` and the metadata.
pub fn partition(
    steps: Vec<CompactedStep>,
    chunk_size: usize,
    metadata: TraceMetadata,
) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let total_chunks = steps.len().div_ceil(chunk_size).max(1);

    let mut chunks = Vec::with_capacity(total_chunks);
    let mut metadata = Some(metadata);
    let mut iter = steps.into_iter();
    for chunk_id in 0..total_chunks {
        let batch: Vec<CompactedStep> = iter.by_ref().take(chunk_size).collect();
        chunks.push(Chunk {
            chunk_id,
            total_chunks,
            payload: ChunkPayload::Plain { steps: batch },
            metadata: metadata.take(),
        });
    }
    chunks
}

/// All chunks of one delivered trace, kept for re-requests.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    chunks: Vec<Chunk>,
}

impl ChunkSet {
    /// Partition and, when `key` is given, seal every chunk.
    pub fn build(
        steps: Vec<CompactedStep>,
        chunk_size: usize,
        metadata: TraceMetadata,
        key: Option<&SessionKey>,
    ) -> Result<Self> {
        let chunks = partition(steps, chunk_size, metadata);
        let chunks = match key {
            Some(key) => chunks
                .into_iter()
                .map(|c| c.encrypt(key))
                .collect::<Result<Vec<_>>>()?,
            None => chunks,
        };
        debug!(total_chunks = chunks.len(), encrypted = key.is_some(), "chunk set built");
        Ok(Self { chunks })
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn get(&self, chunk_id: usize) -> Result<&Chunk> {
        self.chunks
            .get(chunk_id)
            .ok_or_else(|| RelayError::MalformedChunk {
                chunk_id,
                reason: format!("no such chunk (total {})", self.chunks.len()),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }
}
