#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bulkstream::streaming::protocol::{encode_frame, write_frame};
    use bulkstream::{BufferPool, FrameRead, RecordArena, StreamParser};
    use proptest::prelude::*;

    async fn write_all_frames(pool: &Arc<BufferPool>, payloads: &[Vec<u8>]) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        for payload in payloads {
            let frame = encode_frame(pool, payload).unwrap();
            write_frame(&mut out, &frame).await.unwrap();
        }
        out
    }

    async fn read_all_frames(pool: &Arc<BufferPool>, data: &[u8]) -> (Vec<Vec<u8>>, FrameRead) {
        let mut parser = StreamParser::new(data, pool);
        let mut arena = RecordArena::new();
        let mut records = Vec::new();
        loop {
            match parser.next_frame(&mut arena).await.unwrap() {
                FrameRead::Record(r) => records.push(r.to_vec()),
                other => return (records, other),
            }
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
    }

    proptest! {
        #[test]
        fn prop_frames_round_trip(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..6000), 0..16)
        ) {
            let pool = Arc::new(BufferPool::new());
            let (records, end) = runtime().block_on(async {
                let data = write_all_frames(&pool, &payloads).await;
                read_all_frames(&pool, &data).await
            });

            prop_assert_eq!(end, FrameRead::End);
            prop_assert_eq!(records, payloads);
        }

        #[test]
        fn prop_cut_stream_never_yields_partial_record(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..300), 1..8),
            cut in any::<prop::sample::Index>(),
        ) {
            let pool = Arc::new(BufferPool::new());
            let (records, end, cut_at, total) = runtime().block_on(async {
                let data = write_all_frames(&pool, &payloads).await;
                let cut_at = cut.index(data.len());
                let (records, end) = read_all_frames(&pool, &data[..cut_at]).await;
                (records, end, cut_at, data.len())
            });

            prop_assert!(cut_at < total);
            // Every record handed out is a whole, leading payload.
            prop_assert!(records.len() < payloads.len());
            prop_assert_eq!(&records[..], &payloads[..records.len()]);

            let boundary: usize = payloads[..records.len()].iter().map(|p| p.len() + 4).sum();
            if boundary == cut_at {
                prop_assert_eq!(end, FrameRead::End);
            } else {
                let is_truncated = matches!(end, FrameRead::Truncated { .. });
                prop_assert!(is_truncated);
            }
        }
    }

    #[tokio::test]
    async fn test_pool_buffers_are_reused_across_frames() {
        let pool = Arc::new(BufferPool::new());
        let payloads: Vec<Vec<u8>> = (0..32).map(|i| vec![i as u8; 100]).collect();
        let data = write_all_frames(&pool, &payloads).await;
        assert_eq!(data.len(), 32 * 104);

        let snapshot = pool.metrics().snapshot();
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.hits, 31);
    }
}
