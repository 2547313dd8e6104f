use super::SinkError;
use super::store::ShardStore;
use super::writer::{ShardSummary, ShardWriter};
use crate::buffer::{Dequeued, Fragment, WaitingQueue};
use crate::pipeline::{PipelineStats, SplitSettings, Topology};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSummary {
    /// Sealed shards ordered by index.
    pub shards: Vec<ShardSummary>,
    pub workers_spawned: usize,
}

/// State shared by every shard worker of one run.
struct WorkerContext {
    store: Arc<dyn ShardStore>,
    settings: Arc<SplitSettings>,
    header: Option<Bytes>,
    next_index: AtomicU64,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
}

impl WorkerContext {
    async fn open_shard(&self) -> Result<ShardWriter, SinkError> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let name = self.settings.shard_name(index);
        let mut writer = ShardWriter::open(
            self.store.clone(),
            index,
            name,
            self.settings.output_compression,
        )
        .await?;
        if let Some(header) = &self.header {
            match writer.write_bytes(header).await {
                Ok(written) => self.stats.record_shard_bytes(written),
                Err(e) => {
                    writer.discard().await;
                    self.stats.record_discarded();
                    return Err(e);
                }
            }
        }
        Ok(writer)
    }

    async fn seal(&self, writer: ShardWriter) -> Result<ShardSummary, SinkError> {
        let before = writer.bytes_written();
        let summary = match writer.seal().await {
            Ok(summary) => summary,
            Err(e) => {
                self.stats.record_discarded();
                return Err(e);
            }
        };
        self.stats
            .record_shard_bytes(summary.bytes_written.saturating_sub(before));
        self.stats.record_sealed();
        info!(
            shard = %summary.name,
            bytes = summary.bytes_written,
            fragments = summary.fragments,
            "Shard sealed"
        );
        Ok(summary)
    }
}

/// Drains the fragment queue into size-bounded shards with a pool of workers.
pub struct FanOutSink {
    store: Arc<dyn ShardStore>,
    settings: Arc<SplitSettings>,
    input: Arc<WaitingQueue<Fragment>>,
    header_rx: oneshot::Receiver<Option<Bytes>>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
}

impl FanOutSink {
    pub fn new(
        store: Arc<dyn ShardStore>,
        settings: Arc<SplitSettings>,
        input: Arc<WaitingQueue<Fragment>>,
        header_rx: oneshot::Receiver<Option<Bytes>>,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            settings,
            input,
            header_rx,
            stats,
            cancel,
        }
    }

    pub async fn run(self) -> Result<SinkSummary, SinkError> {
        // The scanner resolves the header before it emits any body fragment.
        // A dropped sender means the scanner failed; cancellation covers that.
        let header = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SinkError::Cancelled),
            header = self.header_rx => header.unwrap_or(None),
        };

        let topology = self.settings.topology;
        let context = Arc::new(WorkerContext {
            store: self.store,
            settings: self.settings,
            header,
            next_index: AtomicU64::new(1),
            stats: self.stats,
            cancel: self.cancel,
        });

        let mut workers = JoinSet::new();
        let dispatched = match topology {
            Topology::Static { workers: count } => {
                for _ in 0..count {
                    context.stats.record_worker();
                    workers.spawn(run_worker(context.clone(), self.input.clone()));
                }
                Ok(count)
            }
            Topology::Elastic { max_workers } => {
                dispatch(&context, &self.input, &mut workers, max_workers).await
            }
        };
        if dispatched.is_err() {
            context.cancel.cancel();
        }

        let mut shards = Vec::new();
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(SinkError::Worker(e.to_string())));
            match outcome {
                Ok(sealed) => shards.extend(sealed),
                Err(e) => {
                    if first_error.is_none() {
                        error!(error = %e, "Shard worker failed");
                        context.cancel.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }
        let spawned = match (first_error, dispatched) {
            (Some(e), _) | (None, Err(e)) => return Err(e),
            (None, Ok(spawned)) => spawned,
        };

        shards.sort_by_key(|shard| shard.index);
        info!(
            shards = shards.len(),
            workers = spawned,
            "All shards sealed"
        );
        Ok(SinkSummary {
            shards,
            workers_spawned: spawned,
        })
    }
}

/// Forwards fragments into a work queue shared by the elastic pool, spawning
/// another worker whenever none is idle and the cap allows it.
async fn dispatch(
    context: &Arc<WorkerContext>,
    input: &Arc<WaitingQueue<Fragment>>,
    workers: &mut JoinSet<Result<Vec<ShardSummary>, SinkError>>,
    max_workers: usize,
) -> Result<usize, SinkError> {
    let work = Arc::new(WaitingQueue::new());
    let mut spawned = 0;

    let result = loop {
        let next = tokio::select! {
            _ = context.cancel.cancelled() => break Err(SinkError::Cancelled),
            next = input.dequeue() => next,
        };
        let fragment = match next {
            Dequeued::Item(fragment) => fragment,
            Dequeued::Completed => break Ok(()),
        };
        if !work.is_consumer_waiting() && spawned < max_workers {
            spawned += 1;
            context.stats.record_worker();
            debug!(workers = spawned, backlog = work.len(), "Spawning shard worker");
            workers.spawn(run_worker(context.clone(), work.clone()));
        }
        if let Err(e) = work.enqueue(fragment) {
            break Err(e.into());
        }
    };

    work.complete();
    result.map(|()| spawned)
}

async fn run_worker(
    context: Arc<WorkerContext>,
    queue: Arc<WaitingQueue<Fragment>>,
) -> Result<Vec<ShardSummary>, SinkError> {
    let result = write_shards(&context, &queue).await;
    if let Err(e) = &result
        && !matches!(e, SinkError::Cancelled)
    {
        // Stop the siblings and the upstream stages at their next suspension point.
        context.cancel.cancel();
    }
    result
}

async fn write_shards(
    context: &WorkerContext,
    queue: &WaitingQueue<Fragment>,
) -> Result<Vec<ShardSummary>, SinkError> {
    let mut sealed = Vec::new();
    let mut current: Option<ShardWriter> = None;
    let max_bytes = context.settings.max_bytes_per_shard;

    loop {
        let next = tokio::select! {
            _ = context.cancel.cancelled() => {
                abandon(context, current.take()).await;
                return Err(SinkError::Cancelled);
            }
            next = queue.dequeue() => next,
        };

        let fragment = match next {
            Dequeued::Item(fragment) => fragment,
            Dequeued::Completed => {
                if let Some(writer) = current.take() {
                    sealed.push(context.seal(writer).await?);
                }
                return Ok(sealed);
            }
        };

        let mut writer = match current.take() {
            Some(writer) => writer,
            None => context.open_shard().await?,
        };
        match writer.write(&fragment).await {
            Ok(written) => context.stats.record_write(fragment.len(), written),
            Err(e) => {
                abandon(context, Some(writer)).await;
                return Err(e);
            }
        }
        drop(fragment);

        if writer.bytes_written() >= max_bytes {
            sealed.push(context.seal(writer).await?);
        } else {
            current = Some(writer);
        }
    }
}

async fn abandon(context: &WorkerContext, writer: Option<ShardWriter>) {
    if let Some(writer) = writer {
        debug!(shard = writer.name(), "Discarding unsealed shard");
        writer.discard().await;
        context.stats.record_discarded();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::store::MemoryStore;

    fn settings(topology: Topology, max_bytes: u64) -> Arc<SplitSettings> {
        Arc::new(SplitSettings {
            topology,
            max_bytes_per_shard: max_bytes,
            output_prefix: "part".to_string(),
            ..SplitSettings::default()
        })
    }

    async fn drain<L: AsRef<str>>(
        topology: Topology,
        max_bytes: u64,
        header: Option<&'static str>,
        lines: &[L],
    ) -> (SinkSummary, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let input = Arc::new(WaitingQueue::new());
        for line in lines {
            input
                .enqueue(Fragment::owned(Bytes::copy_from_slice(line.as_ref().as_bytes())))
                .unwrap();
        }
        input.complete();
        let (header_tx, header_rx) = oneshot::channel();
        header_tx.send(header.map(|h| Bytes::from_static(h.as_bytes()))).unwrap();

        let sink = FanOutSink::new(
            store.clone(),
            settings(topology, max_bytes),
            input,
            header_rx,
            Arc::new(PipelineStats::new()),
            CancellationToken::new(),
        );
        (sink.run().await.unwrap(), store)
    }

    #[tokio::test]
    async fn test_single_worker_rolls_shards_at_limit() {
        let (summary, store) = drain(
            Topology::Static { workers: 1 },
            8,
            Some("h\n"),
            &["aaa\n", "bbb\n", "ccc\n"],
        )
        .await;

        let names: Vec<_> = summary.shards.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["part-1.txt", "part-2.txt"]);
        assert_eq!(store.get("part-1.txt").as_deref(), Some(&b"h\naaa\nbbb\n"[..]));
        assert_eq!(store.get("part-2.txt").as_deref(), Some(&b"h\nccc\n"[..]));
    }

    #[tokio::test]
    async fn test_static_pool_writes_every_fragment_once() {
        let lines: Vec<String> = (0..200).map(|i| format!("line-{i:04}\n")).collect();
        let (summary, store) = drain(Topology::Static { workers: 4 }, 64, None, &lines).await;

        assert_eq!(summary.workers_spawned, 4);
        let mut seen: Vec<String> = store
            .shards()
            .values()
            .flat_map(|shard| {
                String::from_utf8(shard.to_vec())
                    .unwrap()
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        seen.sort();
        let mut expected: Vec<String> = lines.iter().map(|l| l.trim_end().to_string()).collect();
        expected.sort();
        assert_eq!(seen, expected);
        assert!(store.peak_open() <= 4);
    }

    #[tokio::test]
    async fn test_no_fragments_means_no_shards() {
        let lines: [&str; 0] = [];
        let (summary, store) =
            drain(Topology::Elastic { max_workers: 4 }, 64, Some("h\n"), &lines).await;
        assert!(summary.shards.is_empty());
        assert_eq!(summary.workers_spawned, 0);
        assert_eq!(store.sealed_count(), 0);
    }

    #[tokio::test]
    async fn test_elastic_pool_respects_cap() {
        let lines = ["x\n"; 500];
        let (summary, store) = drain(Topology::Elastic { max_workers: 3 }, 16, None, &lines).await;
        assert!(summary.workers_spawned >= 1);
        assert!(summary.workers_spawned <= 3);
        assert!(store.peak_open() <= summary.workers_spawned);
        let total: usize = store.shards().values().map(Bytes::len).sum();
        assert_eq!(total, 1000);
    }

    #[tokio::test]
    async fn test_cancellation_discards_open_shards() {
        let store = Arc::new(MemoryStore::new());
        let input = Arc::new(WaitingQueue::new());
        input.enqueue(Fragment::owned(&b"row\n"[..])).unwrap();
        let (header_tx, header_rx) = oneshot::channel();
        header_tx.send(None).unwrap();
        let cancel = CancellationToken::new();

        let sink = FanOutSink::new(
            store.clone(),
            settings(Topology::Static { workers: 1 }, 1024),
            input.clone(),
            header_rx,
            Arc::new(PipelineStats::new()),
            cancel.clone(),
        );
        let handle = tokio::spawn(sink.run());
        while store.open_now() == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        assert!(matches!(handle.await.unwrap(), Err(SinkError::Cancelled)));
        assert_eq!(store.sealed_count(), 0);
        assert_eq!(store.discarded_count(), 1);
    }
}
