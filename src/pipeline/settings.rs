use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIB: usize = 1024 * 1024;

pub const DEFAULT_MAX_BYTES_PER_SHARD: u64 = 200 * MIB as u64;
pub const DEFAULT_BUFFER_CAPACITY: usize = 100 * MIB;
pub const DEFAULT_TARGET_FRAGMENT_SIZE: usize = MIB;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingsError {
    #[error("max_bytes_per_shard must be greater than 0")]
    ZeroShardSize,
    #[error("target_fragment_size must be greater than 0")]
    ZeroFragmentSize,
    #[error(
        "buffer_capacity ({capacity}) must hold at least two target fragments ({target} bytes each)"
    )]
    BufferTooSmall { capacity: usize, target: usize },
    #[error("Output prefix must not be empty")]
    EmptyPrefix,
    #[error("{0:?} is not supported as output compression")]
    UnsupportedOutputCompression(Compression),
    #[error("Worker count must be greater than 0")]
    ZeroWorkers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    /// Single-entry archive. Input only.
    Zip,
}

impl Compression {
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("gz"),
            Compression::Zip => Some("zip"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Text,
    Csv,
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Text => "txt",
            Format::Csv => "csv",
        }
    }
}

/// How shard writers are fanned out over the fragment queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Topology {
    /// Fixed number of workers sharing the fragment queue.
    Static { workers: usize },
    /// Workers spawned on demand while none is idle, up to `max_workers`.
    Elastic { max_workers: usize },
}

impl Topology {
    pub fn worker_limit(self) -> usize {
        match self {
            Topology::Static { workers } => workers,
            Topology::Elastic { max_workers } => max_workers,
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Topology::Elastic {
            max_workers: cores * 2,
        }
    }
}

/// Run configuration consumed by [`SplitPipeline`](super::SplitPipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSettings {
    pub format: Format,
    pub input_compression: Compression,
    pub output_compression: Compression,
    pub has_headers: bool,
    pub max_bytes_per_shard: u64,
    pub buffer_capacity: usize,
    pub target_fragment_size: usize,
    pub topology: Topology,
    /// Shards are named `{output_prefix}-{index}.{ext}`.
    pub output_prefix: String,
}

impl Default for SplitSettings {
    fn default() -> Self {
        Self {
            format: Format::Text,
            input_compression: Compression::None,
            output_compression: Compression::None,
            has_headers: true,
            max_bytes_per_shard: DEFAULT_MAX_BYTES_PER_SHARD,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            target_fragment_size: DEFAULT_TARGET_FRAGMENT_SIZE,
            topology: Topology::default(),
            output_prefix: "segment".to_string(),
        }
    }
}

impl SplitSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_bytes_per_shard == 0 {
            return Err(SettingsError::ZeroShardSize);
        }
        if self.target_fragment_size == 0 {
            return Err(SettingsError::ZeroFragmentSize);
        }
        if self.buffer_capacity / 2 < self.target_fragment_size {
            return Err(SettingsError::BufferTooSmall {
                capacity: self.buffer_capacity,
                target: self.target_fragment_size,
            });
        }
        if self.output_prefix.trim().is_empty() {
            return Err(SettingsError::EmptyPrefix);
        }
        if self.output_compression == Compression::Zip {
            return Err(SettingsError::UnsupportedOutputCompression(
                self.output_compression,
            ));
        }
        if self.topology.worker_limit() == 0 {
            return Err(SettingsError::ZeroWorkers);
        }
        Ok(())
    }

    pub fn shard_extension(&self) -> String {
        match self.output_compression.extension() {
            Some(suffix) => format!("{}.{suffix}", self.format.extension()),
            None => self.format.extension().to_string(),
        }
    }

    pub fn shard_name(&self, index: u64) -> String {
        format!(
            "{}-{index}.{}",
            self.output_prefix,
            self.shard_extension()
        )
    }
}
