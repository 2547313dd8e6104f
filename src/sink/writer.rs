use super::SinkError;
use super::store::{ShardStore, ShardStream};
use crate::buffer::Fragment;
use crate::pipeline::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSummary {
    pub index: u64,
    pub name: String,
    /// Bytes written to the store, after compression.
    pub bytes_written: u64,
    pub fragments: u64,
}

/// One logical output stream. Bytes are counted after compression.
pub struct ShardWriter {
    store: Arc<dyn ShardStore>,
    index: u64,
    name: String,
    stream: ShardStream,
    encoder: Option<GzEncoder<Vec<u8>>>,
    bytes_written: u64,
    fragments: u64,
}

impl ShardWriter {
    pub async fn open(
        store: Arc<dyn ShardStore>,
        index: u64,
        name: String,
        compression: Compression,
    ) -> Result<Self, SinkError> {
        let encoder = match compression {
            Compression::None => None,
            Compression::Gzip => Some(GzEncoder::new(Vec::new(), flate2::Compression::fast())),
            Compression::Zip => return Err(SinkError::UnsupportedCompression(compression)),
        };
        let stream = store.open(&name).await.map_err(|source| SinkError::Io {
            shard: name.clone(),
            source,
        })?;
        debug!(shard = %name, index, "Shard opened");
        Ok(Self {
            store,
            index,
            name,
            stream,
            encoder,
            bytes_written: 0,
            fragments: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Writes a fragment and returns the number of bytes that reached the
    /// stream for it.
    ///
    /// With gzip the encoder is sync-flushed after every fragment, so
    /// `bytes_written` trails the final shard size only by the trailer.
    pub async fn write(&mut self, fragment: &Fragment) -> Result<u64, SinkError> {
        let (front, back) = fragment.as_slices();
        let mut written = self.write_bytes(front).await? + self.write_bytes(back).await?;
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.flush().map_err(|source| SinkError::Io {
                shard: self.name.clone(),
                source,
            })?;
            let staged = std::mem::take(encoder.get_mut());
            written += self.push(&staged).await?;
        }
        self.fragments += 1;
        Ok(written)
    }

    /// Writes raw bytes (used for the header line).
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<u64, SinkError> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let written = match self.encoder.as_mut() {
            Some(encoder) => {
                encoder.write_all(bytes).map_err(|source| SinkError::Io {
                    shard: self.name.clone(),
                    source,
                })?;
                let staged = std::mem::take(encoder.get_mut());
                self.push(&staged).await?
            }
            None => self.push(bytes).await?,
        };
        Ok(written)
    }

    /// Finishes compression, flushes and closes the stream, then lets the
    /// store publish the shard. On failure the shard is discarded before the
    /// error is returned.
    pub async fn seal(mut self) -> Result<ShardSummary, SinkError> {
        if let Err(e) = self.finish().await {
            if let Err(discard) = self.store.discard(&self.name).await {
                warn!(shard = %self.name, error = %discard, "Failed to discard shard");
            }
            return Err(e);
        }
        debug!(shard = %self.name, bytes = self.bytes_written, "Shard sealed");
        Ok(ShardSummary {
            index: self.index,
            name: self.name,
            bytes_written: self.bytes_written,
            fragments: self.fragments,
        })
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        if let Some(encoder) = self.encoder.take() {
            let trailer = encoder.finish().map_err(|source| SinkError::Io {
                shard: self.name.clone(),
                source,
            })?;
            self.push(&trailer).await?;
        }
        self.stream.flush().await.map_err(|source| self.io_error(source))?;
        self.stream
            .shutdown()
            .await
            .map_err(|source| self.io_error(source))?;
        self.store
            .seal(&self.name)
            .await
            .map_err(|source| self.io_error(source))
    }

    /// Abandons the shard. Errors are logged, the shard never becomes visible.
    pub async fn discard(mut self) {
        let _ = self.stream.shutdown().await;
        if let Err(e) = self.store.discard(&self.name).await {
            warn!(shard = %self.name, error = %e, "Failed to discard shard");
        }
    }

    async fn push(&mut self, bytes: &[u8]) -> Result<u64, SinkError> {
        if bytes.is_empty() {
            return Ok(0);
        }
        self.stream
            .write_all(bytes)
            .await
            .map_err(|source| self.io_error(source))?;
        self.bytes_written += bytes.len() as u64;
        Ok(bytes.len() as u64)
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            shard: self.name.clone(),
            source,
        }
    }
}
