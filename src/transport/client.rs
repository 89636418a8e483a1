// src/transport/client.rs

//! Client side of chunk delivery: bounded cache plus prefetching.
//!
//! - decoded chunks live in an LRU cache that is only ever read with `peek`,
//!   so eviction follows insertion order (oldest chunk first)
//! - chunk requests go out over an unbounded channel; a closed channel means
//!   the session is over and is ignored
//! - a chunk that fails to decrypt or decode is dropped from the in-flight
//!   set so it can be requested again, and nothing is cached for it

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::TransportSection;
use crate::crypto::SessionKey;
use crate::errors::{RelayError, Result};
use crate::trace::{Decompactor, RawStep, TraceMetadata};
use crate::transport::chunk::Chunk;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkClientOptions {
    pub cache_capacity: usize,
    pub prefetch_threshold: f64,
    pub prefetch_ahead: usize,
}

impl ChunkClientOptions {
    pub fn from_config(cfg: &TransportSection) -> Self {
        Self {
            cache_capacity: cfg.cache_capacity,
            prefetch_threshold: cfg.prefetch_threshold,
            prefetch_ahead: cfg.prefetch_ahead,
        }
    }
}

impl Default for ChunkClientOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 8,
            prefetch_threshold: 0.8,
            prefetch_ahead: 2,
        }
    }
}

/// Answer to [`ChunkClient::get_chunk`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkFetch {
    Ready(Arc<Vec<RawStep>>),
    /// Requested (or already in flight); not available yet.
    Pending,
}

#[derive(Debug)]
pub struct ChunkClient {
    cache: LruCache<usize, Arc<Vec<RawStep>>>,
    in_flight: HashSet<usize>,
    total_chunks: Option<usize>,
    metadata: Option<TraceMetadata>,
    key: Option<SessionKey>,
    requests: mpsc::UnboundedSender<usize>,
    options: ChunkClientOptions,
}

impl ChunkClient {
    pub fn new(
        options: ChunkClientOptions,
        key: Option<SessionKey>,
        requests: mpsc::UnboundedSender<usize>,
    ) -> Self {
        let capacity = NonZeroUsize::new(options.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            in_flight: HashSet::new(),
            total_chunks: None,
            metadata: None,
            key,
            requests,
            options,
        }
    }

    pub fn total_chunks(&self) -> Option<usize> {
        self.total_chunks
    }

    pub fn metadata(&self) -> Option<&TraceMetadata> {
        self.metadata.as_ref()
    }

    pub fn is_cached(&self, chunk_id: usize) -> bool {
        self.cache.contains(&chunk_id)
    }

    pub fn is_in_flight(&self, chunk_id: usize) -> bool {
        self.in_flight.contains(&chunk_id)
    }

    /// Cached chunk ids, most recently inserted first.
    pub fn cached_ids(&self) -> Vec<usize> {
        self.cache.iter().map(|(id, _)| *id).collect()
    }

    /// Decoded steps of `chunk_id`, or request it and report `Pending`.
    pub fn get_chunk(&mut self, chunk_id: usize) -> ChunkFetch {
        if let Some(steps) = self.cache.peek(&chunk_id) {
            return ChunkFetch::Ready(steps.clone());
        }
        self.request(chunk_id);
        ChunkFetch::Pending
    }

    /// Note that the consumer reached `step_index` of `chunk_id`.
    ///
    /// Past the prefetch threshold, the next `prefetch_ahead` chunks that are
    /// neither cached nor in flight are requested. Returns the ids requested.
    pub fn report_step_progress(&mut self, chunk_id: usize, step_index: usize) -> Vec<usize> {
        let Some(len) = self.cache.peek(&chunk_id).map(|s| s.len()) else {
            return Vec::new();
        };
        if len == 0 {
            return Vec::new();
        }
        let progress = (step_index + 1) as f64 / len as f64;
        if progress < self.options.prefetch_threshold {
            return Vec::new();
        }

        let mut requested = Vec::new();
        for next in chunk_id + 1..=chunk_id + self.options.prefetch_ahead {
            if self.total_chunks.is_some_and(|total| next >= total) {
                break;
            }
            if self.request(next) {
                requested.push(next);
            }
        }
        if !requested.is_empty() {
            debug!(chunk_id, step_index, ?requested, "prefetching chunks");
        }
        requested
    }

    /// Accept a chunk from the server: decrypt, decompact, cache.
    ///
    /// Returns the number of decoded steps.
    pub fn receive(&mut self, chunk: Chunk) -> Result<usize> {
        let chunk_id = chunk.chunk_id;
        self.in_flight.remove(&chunk_id);

        let steps = match self.decode(&chunk) {
            Ok(steps) => steps,
            Err(e) => {
                warn!(chunk_id, error = %e, "dropping undecodable chunk");
                return Err(e);
            }
        };

        self.total_chunks = Some(chunk.total_chunks);
        if let Some(metadata) = chunk.metadata {
            self.metadata = Some(metadata);
        }
        let count = steps.len();
        if let Some((evicted, _)) = self.cache.push(chunk_id, Arc::new(steps)) {
            if evicted != chunk_id {
                debug!(evicted, "chunk evicted from cache");
            }
        }
        Ok(count)
    }

    fn decode(&self, chunk: &Chunk) -> Result<Vec<RawStep>> {
        if chunk.chunk_id >= chunk.total_chunks {
            return Err(RelayError::MalformedChunk {
                chunk_id: chunk.chunk_id,
                reason: format!("id outside 0..{}", chunk.total_chunks),
            });
        }
        let compacted = chunk.open(self.key.as_ref())?;
        Decompactor::new()
            .decompact_all(&compacted)
            .map_err(|e| RelayError::MalformedChunk {
                chunk_id: chunk.chunk_id,
                reason: e.to_string(),
            })
    }

    /// Send a request unless the chunk is cached, in flight or out of range.
    fn request(&mut self, chunk_id: usize) -> bool {
        if self.cache.contains(&chunk_id) || self.in_flight.contains(&chunk_id) {
            return false;
        }
        if self.total_chunks.is_some_and(|total| chunk_id >= total) {
            return false;
        }
        if self.requests.send(chunk_id).is_err() {
            debug!(chunk_id, "chunk request channel closed; ignoring");
            return false;
        }
        self.in_flight.insert(chunk_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{MemoryState, TraceCompactor};
    use crate::transport::server::partition;
    use serde_json::Map;

    fn raw(n: u64) -> Vec<RawStep> {
        (0..n)
            .map(|id| RawStep {
                id,
                step_type: "line_execution".to_string(),
                line: id as u32,
                explanation: None,
                function: None,
                state: MemoryState::default(),
                animation: None,
                extra: Map::new(),
            })
            .collect()
    }

    fn chunks(n: u64, size: usize) -> Vec<Chunk> {
        let compacted = TraceCompactor::with_keyframe_interval(size)
            .compact_all(&raw(n))
            .unwrap();
        partition(compacted, size, TraceMetadata::default())
    }

    #[test]
    fn get_chunk_requests_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = ChunkClient::new(ChunkClientOptions::default(), None, tx);
        assert_eq!(client.get_chunk(0), ChunkFetch::Pending);
        assert_eq!(client.get_chunk(0), ChunkFetch::Pending);
        assert_eq!(rx.try_recv().unwrap(), 0);
        assert!(rx.try_recv().is_err());

        let chunk = chunks(3, 10).remove(0);
        assert_eq!(client.receive(chunk).unwrap(), 3);
        match client.get_chunk(0) {
            ChunkFetch::Ready(steps) => assert_eq!(steps.len(), 3),
            ChunkFetch::Pending => panic!("expected cached chunk"),
        }
    }

    #[test]
    fn out_of_range_chunk_is_malformed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut client = ChunkClient::new(ChunkClientOptions::default(), None, tx);
        let mut chunk = chunks(1, 10).remove(0);
        chunk.chunk_id = 5;
        assert!(matches!(
            client.receive(chunk),
            Err(RelayError::MalformedChunk { chunk_id: 5, .. })
        ));
        assert!(!client.is_cached(5));
    }

    #[test]
    fn closed_request_channel_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut client = ChunkClient::new(ChunkClientOptions::default(), None, tx);
        assert_eq!(client.get_chunk(1), ChunkFetch::Pending);
        assert!(!client.is_in_flight(1));
    }
}
