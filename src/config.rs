use crate::PriceListError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

const DEFAULT_CHANNEL_CAPACITY: usize = 100_000;
const DEFAULT_INITIAL_BATCH: usize = 100;

/// Sizing and behaviour knobs for the pipeline and the top-K store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub channel_capacity: usize,
    pub per_key_cap: usize,
    pub global_cap: usize,
    pub shrink_interval: u64,
    pub initial_produce_batch: usize,
    pub initial_consume_batch: usize,
    pub max_produce_batch: usize,
    pub max_consume_batch: usize,
    pub produce_batch_step: usize,
    pub consume_batch_step: usize,
    pub parallelism: usize,
    pub adaptive: bool,
    pub idle_backoff_ms: u64,
    pub await_timeout_secs: u64,
    pub progress_interval: u64,
    pub queue_full_warning_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl PipelineConfig {
    /// Derive batch limits from the channel capacity.
    ///
    /// Producers may push at most 1% of the channel per iteration, consumers
    /// half of that. Both grow in tenths of their maximum.
    pub fn with_capacity(channel_capacity: usize) -> Self {
        let max_produce_batch = (channel_capacity / 100).max(DEFAULT_INITIAL_BATCH);
        let max_consume_batch = (max_produce_batch / 2).max(DEFAULT_INITIAL_BATCH);

        Self {
            channel_capacity,
            per_key_cap: 20,
            global_cap: 1000,
            shrink_interval: 1000,
            initial_produce_batch: DEFAULT_INITIAL_BATCH,
            initial_consume_batch: DEFAULT_INITIAL_BATCH,
            max_produce_batch,
            max_consume_batch,
            produce_batch_step: (max_produce_batch / 10).max(1),
            consume_batch_step: (max_consume_batch / 10).max(1),
            parallelism: available_parallelism(),
            adaptive: true,
            idle_backoff_ms: 1,
            await_timeout_secs: 365 * 24 * 60 * 60,
            progress_interval: 10_000,
            queue_full_warning_interval: 100_000,
        }
    }

    /// Load a (possibly partial) JSON document on top of the defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, PriceListError> {
        let data = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PriceListError> {
        let positive = [
            ("channel_capacity", self.channel_capacity),
            ("per_key_cap", self.per_key_cap),
            ("global_cap", self.global_cap),
            ("shrink_interval", self.shrink_interval as usize),
            ("initial_produce_batch", self.initial_produce_batch),
            ("initial_consume_batch", self.initial_consume_batch),
            ("produce_batch_step", self.produce_batch_step),
            ("consume_batch_step", self.consume_batch_step),
            ("parallelism", self.parallelism),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(PriceListError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.initial_produce_batch > self.max_produce_batch {
            return Err(PriceListError::Config(format!(
                "initial_produce_batch {} exceeds max_produce_batch {}",
                self.initial_produce_batch, self.max_produce_batch
            )));
        }
        if self.initial_consume_batch > self.max_consume_batch {
            return Err(PriceListError::Config(format!(
                "initial_consume_batch {} exceeds max_consume_batch {}",
                self.initial_consume_batch, self.max_consume_batch
            )));
        }
        Ok(())
    }

    /// Upper bound on required workers of one role.
    pub fn role_limit(&self) -> usize {
        self.parallelism.saturating_sub(1).max(1)
    }

    /// Workers of each role launched by `start`.
    pub fn initial_workers(&self) -> usize {
        (self.parallelism / 2).clamp(1, self.role_limit())
    }

    pub fn log_summary(&self) {
        info!(
            channel_capacity = self.channel_capacity,
            per_key_cap = self.per_key_cap,
            global_cap = self.global_cap,
            shrink_interval = self.shrink_interval,
            parallelism = self.parallelism,
            role_limit = self.role_limit(),
            adaptive = self.adaptive,
            "pipeline configuration"
        );
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}
