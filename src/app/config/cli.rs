use super::groups::RetryConfig;
use super::{ConfigError, LogLevel, TopologyKind};
use crate::pipeline::settings::MIB;
use crate::pipeline::{Compression, Format, SplitSettings, Topology};
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Input files; standard input is read when none is given
    #[arg(long = "input", env = "SPLIT_INPUTS", value_delimiter = ',')]
    pub inputs: Vec<PathBuf>,

    /// Directory receiving the shards
    #[arg(long, env = "OUTPUT_DIR", default_value = "./shards")]
    pub output_dir: PathBuf,

    /// Shard name prefix
    #[arg(long, env = "OUTPUT_PREFIX", default_value = "segment")]
    pub output_prefix: String,

    /// Content format, decides the shard extension
    #[arg(long, env = "FORMAT", default_value = "text")]
    pub format: Format,

    /// Compression of the input stream
    #[arg(long, env = "INPUT_COMPRESSION", default_value = "none")]
    pub input_compression: Compression,

    /// Compression of the shards (none or gzip)
    #[arg(long, env = "OUTPUT_COMPRESSION", default_value = "none")]
    pub output_compression: Compression,

    /// Treat the first line as a header and repeat it in every shard
    #[arg(long, env = "HAS_HEADERS", default_value_t = true, action = ArgAction::Set)]
    pub has_headers: bool,

    /// Shard size limit in MiB, counted after compression
    #[arg(long, env = "MAX_MB_PER_SHARD", default_value = "200")]
    pub max_mb_per_shard: u64,

    /// Ring buffer size in MiB
    #[arg(long, env = "BUFFER_MB", default_value = "100")]
    pub buffer_mb: usize,

    /// Size in KiB at which the scanner flushes a fragment
    #[arg(long, env = "FRAGMENT_KB", default_value = "1024")]
    pub fragment_kb: usize,

    /// Shard writer fan-out strategy
    #[arg(long, env = "TOPOLOGY", default_value = "elastic")]
    pub topology: TopologyKind,

    /// Worker count (static) or cap (elastic); defaults to twice the cores
    #[arg(long, env = "WORKERS")]
    pub workers: Option<usize>,

    /// Log each sealed shard as ready for ingestion
    #[arg(long, env = "NOTIFY_SEALED")]
    pub notify_sealed: bool,

    /// Attempts per input before giving up on transient failures; overrides
    /// `retry_config.max_attempts` when given
    #[arg(long, env = "MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Configuration file path (optional)
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Retry configuration (not exposed as CLI args)
    #[arg(skip)]
    pub retry_config: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            output_dir: PathBuf::from("./shards"),
            output_prefix: "segment".to_string(),
            format: Format::Text,
            input_compression: Compression::None,
            output_compression: Compression::None,
            has_headers: true,
            max_mb_per_shard: 200,
            buffer_mb: 100,
            fragment_kb: 1024,
            topology: TopologyKind::Elastic,
            workers: None,
            notify_sealed: false,
            max_attempts: None,
            log_level: LogLevel::Info,
            config_file: None,
            retry_config: RetryConfig::default(),
        }
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        if let Some(max_attempts) = self.max_attempts {
            self.retry_config.max_attempts = max_attempts;
        }
        if self.workers.is_none() {
            self.workers = Some(default_workers());
        }
        Ok(())
    }

    pub fn topology(&self) -> Topology {
        let workers = self.workers.unwrap_or_else(default_workers);
        match self.topology {
            TopologyKind::Static => Topology::Static { workers },
            TopologyKind::Elastic => Topology::Elastic {
                max_workers: workers,
            },
        }
    }

    /// Shard prefix for one input. With several inputs every input gets its
    /// own folder: `{prefix}/{file name}/segment`.
    pub fn prefix_for(&self, input: Option<&Path>) -> String {
        match input.and_then(Path::file_name) {
            Some(name) if self.inputs.len() > 1 => format!(
                "{}/{}/segment",
                self.output_prefix.trim_end_matches('/'),
                name.to_string_lossy()
            ),
            _ => self.output_prefix.clone(),
        }
    }

    pub fn split_settings(&self, input: Option<&Path>) -> SplitSettings {
        SplitSettings {
            format: self.format,
            input_compression: self.input_compression,
            output_compression: self.output_compression,
            has_headers: self.has_headers,
            max_bytes_per_shard: self.max_mb_per_shard.saturating_mul(MIB as u64),
            buffer_capacity: self.buffer_mb.saturating_mul(MIB),
            target_fragment_size: self.fragment_kb.saturating_mul(1024),
            topology: self.topology(),
            output_prefix: self.prefix_for(input),
        }
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_config.delay_for(attempt)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}
