use proptest::prelude::*;
use tracerelay::trace::{TraceCompactor, TraceMetadata};
use tracerelay::transport::{ChunkPayload, partition};
use tracerelay_test_utils::builders::counting_trace;

proptest! {
    #[test]
    fn chunks_partition_the_compacted_trace(len in 0usize..60, chunk_size in 1usize..12) {
        let compacted = TraceCompactor::with_keyframe_interval(chunk_size)
            .compact_all(&counting_trace(len))
            .unwrap();
        let metadata = TraceMetadata { total_steps: len, ..TraceMetadata::default() };
        let chunks = partition(compacted.clone(), chunk_size, metadata.clone());

        let expected_total = len.div_ceil(chunk_size).max(1);
        prop_assert_eq!(chunks.len(), expected_total);

        let mut joined = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            prop_assert_eq!(chunk.chunk_id, i);
            prop_assert_eq!(chunk.total_chunks, expected_total);
            prop_assert_eq!(chunk.metadata.is_some(), i == 0);
            let ChunkPayload::Plain { steps } = &chunk.payload else {
                return Err(TestCaseError::fail("unexpected encrypted chunk"));
            };
            prop_assert!(steps.len() <= chunk_size);
            // Each chunk opens with a keyframe so it decodes on its own.
            if let Some(first) = steps.first() {
                prop_assert!(first.full_state.is_some());
            }
            joined.extend(steps.iter().cloned());
        }
        prop_assert_eq!(joined, compacted);
        prop_assert_eq!(chunks[0].metadata.clone(), Some(metadata));
    }
}

#[test]
fn two_hundred_fifty_steps_split_into_full_chunks_and_a_remainder() {
    let compacted = TraceCompactor::with_keyframe_interval(100)
        .compact_all(&counting_trace(250))
        .unwrap();
    let metadata = TraceMetadata { total_steps: 250, ..TraceMetadata::default() };
    let chunks = partition(compacted, 100, metadata);

    let sizes: Vec<usize> = chunks
        .iter()
        .map(|c| match &c.payload {
            ChunkPayload::Plain { steps } => steps.len(),
            other => panic!("unexpected payload {other:?}"),
        })
        .collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    assert!(chunks.iter().all(|c| c.total_chunks == 3));
    let starts: Vec<u64> = chunks
        .iter()
        .map(|c| match &c.payload {
            ChunkPayload::Plain { steps } => steps[0].id,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(starts, vec![0, 100, 200]);
}
