use crate::PriceListError;
use crate::config::PipelineConfig;
use crate::csv_source::{CsvFormat, CsvSourceFactory};
use crate::record::{Field, Record};
use crate::scheduler::Scheduler;
use crate::sink::OutputSink;
use crate::source::SourceFactory;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

/// Runs the adaptive pipeline over a set of units of work and returns the
/// cheapest records.
pub struct PriceList {
    config: PipelineConfig,
}

impl PriceList {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process every unit with handles from `factory` and return the final
    /// ordered snapshot.
    pub fn process<F: SourceFactory>(
        &self,
        factory: F,
        units: impl IntoIterator<Item = String>,
    ) -> Result<Vec<Record>, PriceListError> {
        self.config.log_summary();
        let started = Instant::now();

        let scheduler = Scheduler::new(self.config.clone(), factory, units)?;
        scheduler.start();
        if !scheduler.await_termination() {
            return Err(PriceListError::NotReady(format!(
                "workers still running after {}s",
                self.config.await_timeout_secs
            )));
        }

        let records = scheduler.store().get_result()?;
        info!(
            records = records.len(),
            read = scheduler.store().read_total(),
            dropped = scheduler.dropped(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "processing finished"
        );
        Ok(records)
    }

    /// Process CSV files, one unit of work per file.
    pub fn process_files(
        &self,
        paths: &[PathBuf],
        format: CsvFormat,
    ) -> Result<Vec<Record>, PriceListError> {
        let units = paths.iter().map(|p| p.to_string_lossy().into_owned());
        self.process(CsvSourceFactory::new(format), units)
    }

    /// Write `records` with every field in record order.
    pub fn write<S: OutputSink>(
        &self,
        records: &[Record],
        sink: &mut S,
    ) -> Result<(), PriceListError> {
        sink.write(records, &Field::ALL)
    }
}
