use blob_splitter::pipeline::{SplitPipeline, SplitSettings, Topology};
use blob_splitter::sink::MemoryStore;
use proptest::prelude::*;
use std::io::Cursor;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Case {
    lines: Vec<String>,
    trailing_newline: bool,
    has_headers: bool,
    target: usize,
    extra_capacity: usize,
    max_bytes: u64,
    workers: usize,
    elastic: bool,
}

fn case() -> impl Strategy<Value = Case> {
    (
        prop::collection::vec("[a-z0-9,]{0,40}", 0..120),
        any::<bool>(),
        any::<bool>(),
        1usize..64,
        0usize..256,
        1u64..512,
        1usize..5,
        any::<bool>(),
    )
        .prop_map(
            |(lines, trailing_newline, has_headers, target, extra_capacity, max_bytes, workers, elastic)| Case {
                lines,
                trailing_newline,
                has_headers,
                target,
                extra_capacity,
                max_bytes,
                workers,
                elastic,
            },
        )
}

fn split_lines(bytes: &[u8]) -> Vec<Vec<u8>> {
    bytes
        .split_inclusive(|b| *b == b'\n')
        .map(<[u8]>::to_vec)
        .collect()
}

fn run_case(case: &Case) -> Result<(), TestCaseError> {
    let mut input = case.lines.join("\n").into_bytes();
    if case.trailing_newline && !case.lines.is_empty() {
        input.push(b'\n');
    }

    let (header, body) = if case.has_headers {
        let end = input
            .iter()
            .position(|b| *b == b'\n')
            .map_or(input.len(), |i| i + 1);
        input.split_at(end)
    } else {
        input.split_at(0)
    };

    let capacity = case.target * 2 + case.extra_capacity;
    let settings = SplitSettings {
        has_headers: case.has_headers,
        max_bytes_per_shard: case.max_bytes,
        buffer_capacity: capacity,
        target_fragment_size: case.target,
        topology: if case.elastic {
            Topology::Elastic {
                max_workers: case.workers,
            }
        } else {
            Topology::Static {
                workers: case.workers,
            }
        },
        ..SplitSettings::default()
    };

    let store = Arc::new(MemoryStore::new());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    let pipeline = SplitPipeline::new(settings, store.clone())
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    let report = runtime
        .block_on(pipeline.run(Cursor::new(input.clone())))
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

    prop_assert!(report.stats.peak_in_flight <= capacity);
    prop_assert_eq!(store.open_now(), 0);
    prop_assert_eq!(store.sealed_count(), report.shards.len());
    let indices: Vec<u64> = report.shards.iter().map(|s| s.index).collect();
    prop_assert_eq!(indices, (1..=report.shards.len() as u64).collect::<Vec<_>>());

    let mut seen = Vec::new();
    let mut unterminated = 0;
    for summary in &report.shards {
        let shard = store.get(&summary.name).unwrap_or_default();
        prop_assert!(shard.starts_with(header));
        let shard_body = &shard[header.len()..];
        prop_assert!(!shard_body.is_empty(), "{} has no body", summary.name);
        if shard_body.last() != Some(&b'\n') {
            unterminated += 1;
        }
        seen.extend(split_lines(shard_body));
    }

    // Only the shard holding the last line may end without a newline.
    let expected_unterminated = usize::from(!body.is_empty() && body.last() != Some(&b'\n'));
    prop_assert_eq!(unterminated, expected_unterminated);

    let mut expected = split_lines(body);
    seen.sort();
    expected.sort();
    prop_assert_eq!(seen, expected);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn every_line_lands_in_exactly_one_shard(case in case()) {
        run_case(&case)?;
    }
}

#[test]
fn test_tiny_fragments_and_shards_keep_every_line() {
    let case = Case {
        lines: (0..500).map(|i| format!("line-{i}")).collect(),
        trailing_newline: true,
        has_headers: false,
        target: 7,
        extra_capacity: 0,
        max_bytes: 100,
        workers: 1,
        elastic: false,
    };
    run_case(&case).unwrap();
}
