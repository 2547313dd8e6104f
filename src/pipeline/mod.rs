pub mod settings;
pub mod stats;

pub use settings::{Compression, Format, SettingsError, SplitSettings, Topology};
pub use stats::{PipelineStats, StatsSnapshot};

use crate::buffer::{BufferError, RingWriter, WaitingQueue};
use crate::scanner::{LineScanner, ScanSummary, ScannerConfig, ScannerError};
use crate::sink::{FanOutSink, ShardStore, ShardSummary, SinkError, SinkSummary};
use crate::source::{CircularSource, DecompressError, SourceError, SourceSummary, open_input};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid settings: {0}")]
    Config(#[from] SettingsError),
    #[error("Input could not be opened: {0}")]
    Input(#[source] DecompressError),
    #[error("Source failed at offset {offset}: {source}")]
    Source {
        offset: u64,
        #[source]
        source: SourceError,
    },
    #[error("Scanner failed at offset {offset}: {source}")]
    Scanner {
        offset: u64,
        #[source]
        source: ScannerError,
    },
    #[error("Sink failed on shard {shard}: {source}")]
    Sink {
        shard: String,
        #[source]
        source: SinkError,
    },
    #[error("Pipeline stage panicked: {0}")]
    Join(String),
    #[error("Pipeline cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether rerunning the whole split may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Input(e) => e.is_transient(),
            PipelineError::Source { source, .. } => source.is_transient(),
            PipelineError::Sink { source, .. } => source.is_transient(),
            PipelineError::Config(_)
            | PipelineError::Scanner { .. }
            | PipelineError::Join(_)
            | PipelineError::Cancelled => false,
        }
    }

    fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::Source {
                    source: SourceError::Cancelled,
                    ..
                }
                | PipelineError::Scanner {
                    source: ScannerError::Cancelled,
                    ..
                }
                | PipelineError::Sink {
                    source: SinkError::Cancelled,
                    ..
                }
        )
    }
}

impl From<BufferError> for PipelineError {
    fn from(error: BufferError) -> Self {
        PipelineError::Source {
            offset: 0,
            source: SourceError::Buffer(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitReport {
    /// Sealed shards ordered by index.
    pub shards: Vec<ShardSummary>,
    pub header_len: Option<usize>,
    pub bytes_read: u64,
    pub workers_spawned: usize,
    pub stats: StatsSnapshot,
}

impl SplitReport {
    pub fn shard_names(&self) -> impl Iterator<Item = &str> {
        self.shards.iter().map(|shard| shard.name.as_str())
    }
}

/// Splits one input stream into shards written to a [`ShardStore`].
pub struct SplitPipeline {
    settings: Arc<SplitSettings>,
    store: Arc<dyn ShardStore>,
    stats: Arc<PipelineStats>,
}

impl SplitPipeline {
    pub fn new(settings: SplitSettings, store: Arc<dyn ShardStore>) -> Result<Self, PipelineError> {
        settings.validate()?;
        Ok(Self {
            settings: Arc::new(settings),
            store,
            stats: Arc::new(PipelineStats::new()),
        })
    }

    pub fn settings(&self) -> &SplitSettings {
        &self.settings
    }

    /// Counters accumulated over every run of this pipeline.
    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Runs source, scanner and sink concurrently until the input is
    /// exhausted. The first stage failure cancels the others.
    pub async fn run<R>(&self, input: R) -> Result<SplitReport, PipelineError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.run_until(input, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but cancelling `shutdown` aborts the split
    /// and discards every unsealed shard.
    pub async fn run_until<R>(
        &self,
        input: R,
        shutdown: CancellationToken,
    ) -> Result<SplitReport, PipelineError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let settings = self.settings.clone();
        let reader = open_input(input, settings.input_compression)
            .await
            .map_err(PipelineError::Input)?;
        let writer = RingWriter::new(settings.buffer_capacity)?;

        let cancel = shutdown.child_token();
        let raw_ranges = Arc::new(WaitingQueue::new());
        let fragments = Arc::new(WaitingQueue::new());
        let (header_tx, header_rx) = oneshot::channel();

        info!(
            prefix = %settings.output_prefix,
            buffer_capacity = settings.buffer_capacity,
            max_bytes_per_shard = settings.max_bytes_per_shard,
            topology = ?settings.topology,
            "Starting split"
        );

        let source = CircularSource::new(
            reader,
            writer,
            raw_ranges.clone(),
            settings.target_fragment_size,
            self.stats.clone(),
            cancel.clone(),
        );
        let scanner = LineScanner::new(
            ScannerConfig::new(
                settings.has_headers,
                settings.target_fragment_size,
                settings.buffer_capacity,
            ),
            raw_ranges,
            fragments.clone(),
            header_tx,
            self.stats.clone(),
            cancel.clone(),
        );
        let sink = FanOutSink::new(
            self.store.clone(),
            settings.clone(),
            fragments,
            header_rx,
            self.stats.clone(),
            cancel.clone(),
        );

        let source_task: JoinHandle<Result<SourceSummary, SourceError>> =
            spawn_stage(source.run(), cancel.clone());
        let scanner_task: JoinHandle<Result<ScanSummary, ScannerError>> =
            spawn_stage(scanner.run(), cancel.clone());
        let sink_task: JoinHandle<Result<SinkSummary, SinkError>> =
            spawn_stage(sink.run(), cancel.clone());

        let (source_result, scanner_result, sink_result) =
            tokio::join!(source_task, scanner_task, sink_task);

        let stats = self.stats.clone();
        let source_result = joined(source_result, |source| PipelineError::Source {
            offset: source.offset().unwrap_or_else(|| stats.bytes_read()),
            source,
        });
        let scanner_result = joined(scanner_result, |source| PipelineError::Scanner {
            offset: source.offset().unwrap_or(0),
            source,
        });
        let sink_result = joined(sink_result, |source| PipelineError::Sink {
            shard: source.shard().unwrap_or("-").to_string(),
            source,
        });

        match (source_result, scanner_result, sink_result) {
            (Ok(source), Ok(scan), Ok(sink)) => {
                let report = SplitReport {
                    shards: sink.shards,
                    header_len: scan.header_len,
                    bytes_read: source.bytes_read,
                    workers_spawned: sink.workers_spawned,
                    stats: self.stats.snapshot(),
                };
                info!(
                    shards = report.shards.len(),
                    bytes_read = report.bytes_read,
                    workers = report.workers_spawned,
                    elapsed_ms = report.stats.elapsed_ms,
                    "Split completed"
                );
                Ok(report)
            }
            (source, scan, sink) => {
                let errors = [source.err(), scan.err(), sink.err()];
                let error = pick_root_cause(errors);
                error!(error = %error, "Split failed");
                Err(error)
            }
        }
    }
}

fn spawn_stage<T, E, F>(stage: F, cancel: CancellationToken) -> JoinHandle<Result<T, E>>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    tokio::spawn(async move {
        let result = stage.await;
        if let Err(e) = &result
            && !cancel.is_cancelled()
        {
            warn!(error = %e, "Stage failed, cancelling the run");
            cancel.cancel();
        }
        result
    })
}

fn joined<T, E>(
    outcome: Result<Result<T, E>, tokio::task::JoinError>,
    wrap: impl FnOnce(E) -> PipelineError,
) -> Result<T, PipelineError> {
    match outcome {
        Ok(result) => result.map_err(wrap),
        Err(e) => Err(PipelineError::Join(e.to_string())),
    }
}

/// The first non-cancellation error in stage order, otherwise `Cancelled`.
fn pick_root_cause(errors: [Option<PipelineError>; 3]) -> PipelineError {
    let mut cancelled = None;
    for error in errors.into_iter().flatten() {
        if error.is_cancellation() {
            cancelled.get_or_insert(error);
        } else {
            return error;
        }
    }
    cancelled.unwrap_or(PipelineError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryStore;
    use std::io::Cursor;

    fn small_settings() -> SplitSettings {
        SplitSettings {
            max_bytes_per_shard: 1024,
            buffer_capacity: 256,
            target_fragment_size: 16,
            topology: Topology::Static { workers: 2 },
            ..SplitSettings::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_before_running() {
        let settings = SplitSettings {
            output_compression: Compression::Zip,
            ..SplitSettings::default()
        };
        let result = SplitPipeline::new(settings, Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_small_input_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = SplitPipeline::new(small_settings(), store.clone()).unwrap();
        let report = pipeline
            .run(Cursor::new(b"h1,h2\na,b\nc,d\n".to_vec()))
            .await
            .unwrap();

        assert_eq!(report.shards.len(), 1);
        assert_eq!(report.header_len, Some(6));
        assert_eq!(report.bytes_read, 14);
        let shard = store.get(&report.shards[0].name).unwrap();
        assert_eq!(&shard[..], b"h1,h2\na,b\nc,d\n");
    }

    #[tokio::test]
    async fn test_shutdown_discards_open_shards() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = SplitPipeline::new(small_settings(), store.clone()).unwrap();
        let (mut feed, input) = tokio::io::duplex(64);
        let shutdown = CancellationToken::new();

        let run = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { pipeline.run_until(input, shutdown).await }
        });
        tokio::io::AsyncWriteExt::write_all(&mut feed, b"h\nline one\nline two\n")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.cancel();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(ref e) if e.is_cancellation()));
        assert_eq!(store.sealed_count(), 0);
        assert_eq!(store.open_now(), 0);
        drop(feed);
    }

    #[test]
    fn test_root_cause_prefers_real_failures() {
        let errors = [
            Some(PipelineError::Source {
                offset: 3,
                source: SourceError::Cancelled,
            }),
            None,
            Some(PipelineError::Sink {
                shard: "s-1.txt".to_string(),
                source: SinkError::Io {
                    shard: "s-1.txt".to_string(),
                    source: std::io::Error::other("disk full"),
                },
            }),
        ];
        let error = pick_root_cause(errors);
        assert!(matches!(error, PipelineError::Sink { .. }));
        assert!(error.is_transient());
    }

    #[test]
    fn test_only_cancellations_report_cancelled_stage() {
        let errors = [
            None,
            Some(PipelineError::Scanner {
                offset: 0,
                source: ScannerError::Cancelled,
            }),
            None,
        ];
        assert!(!pick_root_cause(errors).is_transient());
    }
}
