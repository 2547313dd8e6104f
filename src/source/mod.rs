pub mod decompress;

pub use decompress::{DecompressError, InputReader, open_input};

use crate::buffer::{BufferError, Fragment, RingWriter, WaitingQueue};
use crate::pipeline::PipelineStats;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Read failed at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("Source cancelled")]
    Cancelled,
}

impl SourceError {
    pub fn offset(&self) -> Option<u64> {
        match self {
            SourceError::Read { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Read { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Filling,
    Stalled,
    Draining,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSummary {
    pub bytes_read: u64,
    pub raw_ranges: u64,
    pub stalls: u64,
}

/// Reads the input into the ring and publishes each read as a raw fragment.
///
/// When the ring has no free space the source stalls on the release queue
/// until downstream stages drop the fragments pinning the oldest range.
pub struct CircularSource<R> {
    reader: R,
    writer: RingWriter,
    output: Arc<WaitingQueue<Fragment>>,
    max_read: usize,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    state: SourceState,
}

impl<R> CircularSource<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        reader: R,
        writer: RingWriter,
        output: Arc<WaitingQueue<Fragment>>,
        max_read: usize,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            writer,
            output,
            max_read: max_read.max(1),
            stats,
            cancel,
            state: SourceState::Filling,
        }
    }

    /// Runs until end of input. The output queue is completed on every exit
    /// path so downstream consumers never wait on a dead source.
    ///
    /// Returns once the input is exhausted; `SplitPipeline::run_until` joins
    /// it with the scanner and the sink before reporting.
    pub async fn run(mut self) -> Result<SourceSummary, SourceError> {
        let result = self.fill().await;
        self.output.complete();
        result
    }

    async fn fill(&mut self) -> Result<SourceSummary, SourceError> {
        let mut summary = SourceSummary {
            bytes_read: 0,
            raw_ranges: 0,
            stalls: 0,
        };

        loop {
            self.writer.drain_releases()?;

            if self.writer.free_contiguous() == 0 {
                self.enter(SourceState::Stalled);
                summary.stalls += 1;
                self.stats.record_stall();
                debug!(
                    written = self.writer.written(),
                    oldest_unreleased = self.writer.oldest_unreleased(),
                    "Ring full, waiting for release"
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(SourceError::Cancelled),
                    released = self.writer.wait_for_release() => { released?; }
                }
                continue;
            }
            self.enter(SourceState::Filling);

            let offset = self.writer.written();
            let region = self.writer.writable(self.max_read);
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SourceError::Cancelled),
                read = self.reader.read(region) => read,
            };
            let read = read.map_err(|source| SourceError::Read { offset, source })?;

            if read == 0 {
                self.enter(SourceState::Draining);
                break;
            }

            let fragment = self.writer.publish(read)?;
            summary.bytes_read += read as u64;
            summary.raw_ranges += 1;
            self.stats.record_read(read, self.writer.in_flight());
            self.output.enqueue(fragment)?;
        }

        self.enter(SourceState::Completed);
        info!(
            bytes_read = summary.bytes_read,
            raw_ranges = summary.raw_ranges,
            stalls = summary.stalls,
            "Source reached end of input"
        );
        Ok(summary)
    }
}

impl<R> CircularSource<R> {
    fn enter(&mut self, next: SourceState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Source state changed");
            self.state = next;
        }
    }
}
