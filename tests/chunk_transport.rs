// tests/chunk_transport.rs

mod common;
use crate::common::builders::counting_trace;
use crate::common::init_tracing;

use tokio::sync::mpsc;

use tracerelay::crypto::{CryptoHelper, EncryptedPayload};
use tracerelay::errors::RelayError;
use tracerelay::trace::{TraceCompactor, TraceMetadata};
use tracerelay::transport::{
    Chunk, ChunkClient, ChunkClientOptions, ChunkFetch, ChunkPayload, ChunkSet,
};

fn chunk_set(steps: usize, chunk_size: usize, key: Option<&tracerelay::crypto::SessionKey>) -> ChunkSet {
    let raw = counting_trace(steps);
    let compacted = TraceCompactor::with_keyframe_interval(chunk_size)
        .compact_all(&raw)
        .unwrap();
    let metadata = TraceMetadata {
        total_steps: steps,
        ..TraceMetadata::default()
    };
    ChunkSet::build(compacted, chunk_size, metadata, key).unwrap()
}

fn client(
    capacity: usize,
    key: Option<tracerelay::crypto::SessionKey>,
) -> (ChunkClient, mpsc::UnboundedReceiver<usize>) {
    init_tracing();
    let (tx, rx) = mpsc::unbounded_channel();
    let options = ChunkClientOptions {
        cache_capacity: capacity,
        prefetch_threshold: 0.8,
        prefetch_ahead: 2,
    };
    (ChunkClient::new(options, key, tx), rx)
}

fn requested(rx: &mut mpsc::UnboundedReceiver<usize>) -> Vec<usize> {
    let mut ids = Vec::new();
    while let Ok(id) = rx.try_recv() {
        ids.push(id);
    }
    ids
}

#[test]
fn prefetch_starts_at_eighty_percent_of_a_chunk() {
    let set = chunk_set(50, 10, None);
    let (mut client, mut rx) = client(8, None);
    client.receive(set.get(0).unwrap().clone()).unwrap();

    // Steps 0..=6 are below the threshold.
    for step in 0..7 {
        assert!(client.report_step_progress(0, step).is_empty());
    }
    assert!(requested(&mut rx).is_empty());

    // (7 + 1) / 10 = 0.8
    assert_eq!(client.report_step_progress(0, 7), vec![1, 2]);
    assert_eq!(requested(&mut rx), vec![1, 2]);
    assert!(client.is_in_flight(1) && client.is_in_flight(2));

    // Already in flight: nothing new.
    assert!(client.report_step_progress(0, 8).is_empty());

    client.receive(set.get(1).unwrap().clone()).unwrap();
    assert!(!client.is_in_flight(1));
    assert!(client.is_cached(1));
}

#[test]
fn prefetch_stops_at_the_last_chunk() {
    let set = chunk_set(30, 10, None);
    let (mut client, mut rx) = client(8, None);
    client.receive(set.get(2).unwrap().clone()).unwrap();
    assert!(client.report_step_progress(2, 9).is_empty());

    client.receive(set.get(1).unwrap().clone()).unwrap();
    assert_eq!(client.report_step_progress(1, 9), Vec::<usize>::new());
    assert!(requested(&mut rx).is_empty());
}

#[test]
fn cache_evicts_oldest_insertion_first() {
    let set = chunk_set(50, 10, None);
    let (mut client, mut rx) = client(3, None);

    for id in [0, 1, 2] {
        client.receive(set.get(id).unwrap().clone()).unwrap();
    }
    // Reading chunk 0 does not refresh it.
    assert!(matches!(client.get_chunk(0), ChunkFetch::Ready(_)));
    client.receive(set.get(3).unwrap().clone()).unwrap();

    assert!(!client.is_cached(0));
    assert_eq!(client.cached_ids(), vec![3, 2, 1]);

    assert_eq!(client.get_chunk(0), ChunkFetch::Pending);
    assert_eq!(requested(&mut rx), vec![0]);
    // A second miss while in flight does not re-request.
    assert_eq!(client.get_chunk(0), ChunkFetch::Pending);
    assert!(requested(&mut rx).is_empty());
}

#[test]
fn decoded_chunks_concatenate_to_the_original_trace() {
    let raw = counting_trace(23);
    let set = chunk_set(23, 5, None);
    assert_eq!(set.total_chunks(), 5);

    let (mut client, _rx) = client(8, None);
    let mut decoded = Vec::new();
    for chunk in set.iter() {
        client.receive(chunk.clone()).unwrap();
        match client.get_chunk(chunk.chunk_id) {
            ChunkFetch::Ready(steps) => decoded.extend(steps.iter().cloned()),
            ChunkFetch::Pending => panic!("chunk {} not cached", chunk.chunk_id),
        }
    }
    assert_eq!(decoded, raw);
    assert_eq!(client.total_chunks(), Some(5));
    assert_eq!(client.metadata().map(|m| m.total_steps), Some(23));
}

#[test]
fn tampered_ciphertext_is_rejected() {
    let helper = CryptoHelper::new("chunk-test-secret");
    let key = helper.derive_key("session-1");
    let set = chunk_set(12, 4, Some(&key));
    let (mut client, _rx) = client(8, Some(key.clone()));

    let mut chunk = set.get(1).unwrap().clone();
    if let ChunkPayload::Encrypted(EncryptedPayload { encrypted_data, .. }) = &mut chunk.payload {
        let mut bytes = encrypted_data.clone().into_bytes();
        bytes[0] = if bytes[0] == b'A' { b'B' } else { b'A' };
        *encrypted_data = String::from_utf8(bytes).unwrap();
    } else {
        panic!("chunk should be encrypted");
    }
    assert!(matches!(client.receive(chunk), Err(RelayError::DecryptionError)));
    assert!(!client.is_cached(1));

    // A ciphertext replayed under another chunk id fails authentication.
    let mut moved = set.get(2).unwrap().clone();
    moved.chunk_id = 0;
    assert!(matches!(client.receive(moved), Err(RelayError::DecryptionError)));

    assert_eq!(client.receive(set.get(2).unwrap().clone()).unwrap(), 4);
}

#[test]
fn chunk_ids_out_of_range_are_malformed() {
    let set = chunk_set(10, 5, None);
    assert!(matches!(set.get(2), Err(RelayError::MalformedChunk { chunk_id: 2, .. })));

    let mut chunk: Chunk = set.get(1).unwrap().clone();
    chunk.chunk_id = 9;
    let (mut client, _rx) = client(4, None);
    assert!(matches!(
        client.receive(chunk),
        Err(RelayError::MalformedChunk { chunk_id: 9, .. })
    ));
}
