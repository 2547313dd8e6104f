pub mod config;
pub mod logging_system;

pub use config::{Config, ConfigError, LogLevel, RetryConfig};
pub use logging_system::{LoggingError, LoggingSystem, setup_logging_safe};

use crate::pipeline::{PipelineError, SplitPipeline, SplitReport};
use crate::sink::{LocalDirStore, NotifyingStore, ShardStore};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One input handed to the splitter; `None` reads standard input.
type InputSource = Option<PathBuf>;

pub struct App {
    config: Config,
    store: Arc<dyn ShardStore>,
    notifier: Option<JoinHandle<usize>>,
    shutdown: CancellationToken,
}

impl App {
    pub fn from_args<I, T>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Config::from_args(args)?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let config = match &config.config_file {
            Some(config_file) => {
                eprintln!("Loading configuration from file: {}", config_file.display());
                Config::from_file(config_file)
                    .with_context(|| format!("loading {}", config_file.display()))?
            }
            None => {
                config.validate()?;
                config
            }
        };

        if let Err(e) = setup_logging_safe(config.log_level) {
            eprintln!("Warning: {e}");
        }

        info!("Starting blob-splitter v{}", env!("CARGO_PKG_VERSION"));
        info!(
            inputs = config.inputs.len(),
            output_dir = %config.output_dir.display(),
            topology = ?config.topology(),
            "Configuration loaded"
        );

        let local = LocalDirStore::new(&config.output_dir);
        let (store, notifier): (Arc<dyn ShardStore>, _) = if config.notify_sealed {
            let (store, mut sealed) = NotifyingStore::new(local, 64);
            let notifier = tokio::spawn(async move {
                let mut count = 0;
                while let Some(name) = sealed.recv().await {
                    count += 1;
                    info!(shard = %name, "Shard ready for ingestion");
                }
                count
            });
            (Arc::new(store), Some(notifier))
        } else {
            (Arc::new(local), None)
        };

        Ok(Self {
            config,
            store,
            notifier,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancelling this token aborts the current split.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Splits every configured input in turn and returns one report per
    /// input.
    pub async fn run(self) -> anyhow::Result<Vec<SplitReport>> {
        let sources: Vec<InputSource> = if self.config.inputs.is_empty() {
            vec![None]
        } else {
            self.config.inputs.iter().cloned().map(Some).collect()
        };

        let mut reports = Vec::with_capacity(sources.len());
        for source in &sources {
            let report = self.split_with_retry(source.as_deref()).await?;
            println!("{}", summary_line(source.as_deref(), &report));
            reports.push(report);
        }

        let Self {
            store, notifier, ..
        } = self;
        // The notifier ends once the last store handle is gone.
        drop(store);
        if let Some(notifier) = notifier {
            match notifier.await {
                Ok(count) => info!(sealed = count, "All sealed shards announced"),
                Err(e) => warn!(error = %e, "Shard notifier stopped unexpectedly"),
            }
        }
        Ok(reports)
    }

    async fn split_with_retry(&self, input: Option<&Path>) -> anyhow::Result<SplitReport> {
        let label = input.map_or_else(|| "<stdin>".to_string(), |p| p.display().to_string());
        let max_attempts = self.config.retry_config.max_attempts;
        let mut attempt = 1;
        loop {
            match self.split_once(input).await {
                Ok(report) => return Ok(report),
                // Standard input cannot be replayed.
                Err(e) if e.is_transient() && input.is_some() && attempt < max_attempts => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        input = %label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Split failed, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.shutdown.cancelled() => return Err(PipelineError::Cancelled.into()),
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!("splitting {label}")));
                }
            }
        }
    }

    async fn split_once(&self, input: Option<&Path>) -> Result<SplitReport, PipelineError> {
        let settings = self.config.split_settings(input);
        let pipeline = SplitPipeline::new(settings, self.store.clone())?;
        match input {
            Some(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    PipelineError::Input(crate::source::DecompressError::Io(e))
                })?;
                self.run_pipeline(&pipeline, file).await
            }
            None => self.run_pipeline(&pipeline, tokio::io::stdin()).await,
        }
    }

    async fn run_pipeline<R>(
        &self,
        pipeline: &SplitPipeline,
        input: R,
    ) -> Result<SplitReport, PipelineError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        pipeline.run_until(input, self.shutdown.clone()).await
    }
}

fn summary_line(input: Option<&Path>, report: &SplitReport) -> serde_json::Value {
    serde_json::json!({
        "input": input.map(|p| p.display().to_string()),
        "shards": report.shard_names().collect::<Vec<_>>(),
        "header_len": report.header_len,
        "bytes_read": report.bytes_read,
        "workers_spawned": report.workers_spawned,
        "stats": report.stats,
    })
}

// Main entry point for the application
pub async fn main() -> anyhow::Result<()> {
    let app = match App::from_args(std::env::args_os()) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            process::exit(2);
        }
    };

    let shutdown = app.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, discarding unsealed shards");
            shutdown.cancel();
        }
    });

    match app.run().await {
        Ok(reports) => {
            let shards: usize = reports.iter().map(|r| r.shards.len()).sum();
            info!(inputs = reports.len(), shards, "blob-splitter finished");
            Ok(())
        }
        Err(e) => {
            error!("Split error: {e:#}");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_input(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_app_splits_each_input_into_its_own_folder() {
        let inputs = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let a = write_input(&inputs, "a.csv", b"id,v\n1,x\n2,y\n");
        let b = write_input(&inputs, "b.csv", b"id,v\n3,z\n");

        let config = Config {
            inputs: vec![a, b],
            output_dir: output.path().to_path_buf(),
            format: crate::pipeline::Format::Csv,
            workers: Some(2),
            buffer_mb: 1,
            fragment_kb: 64,
            ..Config::default()
        };
        let app = App::from_config(config).unwrap();
        let reports = app.run().await.unwrap();

        assert_eq!(reports.len(), 2);
        let first = output.path().join("segment/a.csv/segment-1.csv");
        let second = output.path().join("segment/b.csv/segment-1.csv");
        assert_eq!(std::fs::read(first).unwrap(), b"id,v\n1,x\n2,y\n");
        assert_eq!(std::fs::read(second).unwrap(), b"id,v\n3,z\n");
    }

    #[tokio::test]
    async fn test_missing_input_is_not_retried_forever() {
        let output = TempDir::new().unwrap();
        let config = Config {
            inputs: vec![output.path().join("does-not-exist.txt")],
            output_dir: output.path().to_path_buf(),
            retry_config: RetryConfig {
                max_attempts: 2,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(1),
                jitter: false,
            },
            buffer_mb: 1,
            fragment_kb: 64,
            ..Config::default()
        };
        let app = App::from_config(config).unwrap();
        let error = app.run().await.unwrap_err();
        assert!(format!("{error:#}").contains("does-not-exist.txt"));
    }

    #[tokio::test]
    async fn test_notifier_counts_sealed_shards() {
        let inputs = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let path = write_input(&inputs, "only.txt", b"head\nbody\n");

        let config = Config {
            inputs: vec![path],
            output_dir: output.path().to_path_buf(),
            notify_sealed: true,
            buffer_mb: 1,
            fragment_kb: 64,
            ..Config::default()
        };
        let app = App::from_config(config).unwrap();
        let reports = app.run().await.unwrap();
        assert_eq!(reports[0].shards.len(), 1);
        assert!(output.path().join("segment-1.txt").exists());
    }
}
