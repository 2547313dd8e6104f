use super::{Config, ConfigError};
use crate::pipeline::Compression;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_compression == Compression::Zip {
            return Err(ConfigError::InvalidConfig(
                "Zip is only supported as input compression".to_string(),
            ));
        }

        if self.max_mb_per_shard == 0 {
            return Err(ConfigError::InvalidConfig(
                "Shard size must be greater than 0".to_string(),
            ));
        }

        if self.fragment_kb == 0 {
            return Err(ConfigError::InvalidConfig(
                "Fragment size must be greater than 0".to_string(),
            ));
        }

        // The ring must hold two fragments so the scanner can spill its carry.
        if self.buffer_mb.saturating_mul(1024) < self.fragment_kb.saturating_mul(2) {
            return Err(ConfigError::InvalidConfig(format!(
                "Buffer ({} MiB) must hold at least two fragments of {} KiB",
                self.buffer_mb, self.fragment_kb
            )));
        }

        if let Some(0) = self.workers {
            return Err(ConfigError::InvalidConfig(
                "Worker count must be greater than 0".to_string(),
            ));
        }

        if self.output_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "Output prefix must not be empty".to_string(),
            ));
        }

        if self.inputs.iter().any(|path| path.as_os_str().is_empty()) {
            return Err(ConfigError::InvalidConfig(
                "Input paths must not be empty".to_string(),
            ));
        }

        if self.retry_config.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "Retry max attempts must be greater than 0".to_string(),
            ));
        }

        for input in &self.inputs {
            self.split_settings(Some(input)).validate()?;
        }
        if self.inputs.is_empty() {
            self.split_settings(None).validate()?;
        }

        Ok(())
    }
}
