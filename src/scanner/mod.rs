//! Line scanner: turns raw ring ranges into line-aligned fragments.

use crate::buffer::{BufferError, Dequeued, Fragment, FragmentError, WaitingQueue};
use crate::pipeline::PipelineStats;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const NEWLINE: u8 = b'\n';

#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("Fragment error at offset {offset}: {source}")]
    Fragment {
        offset: u64,
        #[source]
        source: FragmentError,
    },
    #[error("Buffer error at offset {offset}: {source}")]
    Buffer {
        offset: u64,
        #[source]
        source: BufferError,
    },
    #[error("Scanner cancelled")]
    Cancelled,
}

impl ScannerError {
    pub fn offset(&self) -> Option<u64> {
        match self {
            ScannerError::Fragment { offset, .. } | ScannerError::Buffer { offset, .. } => {
                Some(*offset)
            }
            ScannerError::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannerConfig {
    pub has_headers: bool,
    pub target_fragment_size: usize,
    /// Carried bytes at which the carry is copied out of the ring.
    pub spill_threshold: usize,
}

impl ScannerConfig {
    pub fn new(has_headers: bool, target_fragment_size: usize, ring_capacity: usize) -> Self {
        Self {
            has_headers,
            target_fragment_size: target_fragment_size.max(1),
            spill_threshold: (ring_capacity / 2).max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub bytes_scanned: u64,
    pub fragments: u64,
    pub header_len: Option<usize>,
    pub spills: u64,
}

/// Reads raw fragments, isolates the header line and emits fragments that end
/// on a newline once at least `target_fragment_size` bytes have accumulated.
pub struct LineScanner {
    config: ScannerConfig,
    input: Arc<WaitingQueue<Fragment>>,
    output: Arc<WaitingQueue<Fragment>>,
    header_tx: Option<oneshot::Sender<Option<Bytes>>>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    // Unflushed bytes that still live in the ring.
    carry: Fragment,
    // Unflushed bytes copied out of the ring after the carry grew too large.
    spill: BytesMut,
    header_pending: bool,
    scanned: u64,
    summary: ScanSummary,
}

impl LineScanner {
    pub fn new(
        config: ScannerConfig,
        input: Arc<WaitingQueue<Fragment>>,
        output: Arc<WaitingQueue<Fragment>>,
        header_tx: oneshot::Sender<Option<Bytes>>,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            header_pending: config.has_headers,
            config,
            input,
            output,
            header_tx: Some(header_tx),
            stats,
            cancel,
            carry: Fragment::empty(),
            spill: BytesMut::new(),
            scanned: 0,
            summary: ScanSummary {
                bytes_scanned: 0,
                fragments: 0,
                header_len: None,
                spills: 0,
            },
        }
    }

    /// Scans until the input queue completes. The output queue is completed
    /// on every exit path.
    pub async fn run(mut self) -> Result<ScanSummary, ScannerError> {
        let result = self.scan().await;
        self.output.complete();
        result
    }

    async fn scan(&mut self) -> Result<ScanSummary, ScannerError> {
        if !self.config.has_headers {
            self.send_header(None);
        }

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ScannerError::Cancelled),
                next = self.input.dequeue() => next,
            };
            match next {
                Dequeued::Item(raw) => self.consume(raw)?,
                Dequeued::Completed => break,
            }
        }

        self.finish()?;
        info!(
            bytes_scanned = self.summary.bytes_scanned,
            fragments = self.summary.fragments,
            spills = self.summary.spills,
            "Scanner reached end of input"
        );
        Ok(self.summary.clone())
    }

    fn consume(&mut self, raw: Fragment) -> Result<(), ScannerError> {
        let raw_len = raw.len() as u64;
        let mut rest = raw;

        if self.header_pending {
            match rest.position(NEWLINE, 0) {
                Some(boundary) => {
                    let line = self.splice_before(&rest, boundary)?;
                    rest = self.splice_after(&rest, boundary)?;
                    self.absorb(line)?;
                    let header = self.take_pending();
                    self.header_pending = false;
                    self.send_header(Some(header.to_bytes()));
                }
                None => {
                    self.absorb(rest)?;
                    self.scanned += raw_len;
                    return Ok(());
                }
            }
        }

        while !rest.is_empty() {
            let needed = self
                .config
                .target_fragment_size
                .saturating_sub(self.pending_len())
                .saturating_sub(1);
            if needed >= rest.len() {
                break;
            }
            let Some(boundary) = rest.position(NEWLINE, needed) else {
                break;
            };
            let piece = self.splice_before(&rest, boundary)?;
            rest = self.splice_after(&rest, boundary)?;
            self.absorb(piece)?;
            let fragment = self.take_pending();
            self.emit(fragment)?;
        }

        if !rest.is_empty() {
            self.absorb(rest)?;
        }
        self.scanned += raw_len;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ScannerError> {
        let remainder = self.take_pending();
        if self.header_pending {
            // Input ended before the first newline: the remainder is the header.
            self.header_pending = false;
            let header = (!remainder.is_empty()).then(|| remainder.to_bytes());
            self.send_header(header);
        } else if !remainder.is_empty() {
            self.emit(remainder)?;
        }
        self.summary.bytes_scanned = self.scanned;
        Ok(())
    }

    fn pending_len(&self) -> usize {
        self.carry.len() + self.spill.len()
    }

    /// Appends `part` to the unflushed bytes, copying out of the ring once the
    /// carry reaches the spill threshold.
    fn absorb(&mut self, part: Fragment) -> Result<(), ScannerError> {
        if !self.spill.is_empty() {
            part.extend_into(&mut self.spill);
            return Ok(());
        }
        let carry = std::mem::take(&mut self.carry);
        self.carry = carry.merge(part).map_err(|source| ScannerError::Fragment {
            offset: self.scanned,
            source,
        })?;
        if self.carry.len() >= self.config.spill_threshold {
            self.carry.extend_into(&mut self.spill);
            self.carry = Fragment::empty();
            self.summary.spills += 1;
            self.stats.record_spill();
            debug!(
                carried = self.spill.len(),
                offset = self.scanned,
                "Long line copied out of the ring"
            );
        }
        Ok(())
    }

    fn take_pending(&mut self) -> Fragment {
        if self.spill.is_empty() {
            std::mem::take(&mut self.carry)
        } else {
            Fragment::owned(self.spill.split().freeze())
        }
    }

    fn emit(&mut self, fragment: Fragment) -> Result<(), ScannerError> {
        self.output
            .enqueue(fragment)
            .map_err(|source| ScannerError::Buffer {
                offset: self.scanned,
                source,
            })?;
        self.summary.fragments += 1;
        self.stats.record_fragment();
        Ok(())
    }

    fn send_header(&mut self, header: Option<Bytes>) {
        if let Some(tx) = self.header_tx.take() {
            let len = header.as_ref().map(Bytes::len);
            self.summary.header_len = len;
            self.stats.record_header(len.unwrap_or(0));
            debug!(header_len = len, "Header resolved");
            // The sink may already have failed and dropped its receiver.
            let _ = tx.send(header);
        }
    }

    fn splice_before(&self, fragment: &Fragment, index: usize) -> Result<Fragment, ScannerError> {
        fragment
            .splice_before(index)
            .map_err(|source| ScannerError::Fragment {
                offset: self.scanned,
                source,
            })
    }

    fn splice_after(&self, fragment: &Fragment, index: usize) -> Result<Fragment, ScannerError> {
        fragment
            .splice_after(index)
            .map_err(|source| ScannerError::Fragment {
                offset: self.scanned,
                source,
            })
    }
}
