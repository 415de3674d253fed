use clap::Parser;
use pricelist::csv_source::CsvFormat;
use pricelist::sink::CsvSink;
use pricelist::{PipelineConfig, PriceList, PriceListError};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "pricelist")]
#[command(about = "Keep the cheapest products across many price-list CSV files", long_about = None)]
struct Cli {
    /// Price-list CSV files to read
    files: Vec<PathBuf>,
    /// Where to write the result
    #[arg(short, long, default_value = "result.csv")]
    output: PathBuf,
    /// Input files start with a header row, and the output gets one too
    #[arg(long)]
    headers: bool,
    /// Field delimiter for input and output
    #[arg(short, long, default_value_t = ',')]
    delimiter: char,
    /// JSON file with pipeline settings
    #[arg(long)]
    config: Option<PathBuf>,
    /// Keep worker counts and batch sizes fixed
    #[arg(long)]
    no_adaptive: bool,
    #[arg(long)]
    parallelism: Option<usize>,
    /// Records kept per product ID
    #[arg(long)]
    per_key_cap: Option<usize>,
    /// Records kept overall
    #[arg(long)]
    global_cap: Option<usize>,
}

impl Cli {
    fn pipeline_config(&self) -> Result<PipelineConfig, PriceListError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };
        if self.no_adaptive {
            config.adaptive = false;
        }
        if let Some(parallelism) = self.parallelism {
            config.parallelism = parallelism;
        }
        if let Some(cap) = self.per_key_cap {
            config.per_key_cap = cap;
        }
        if let Some(cap) = self.global_cap {
            config.global_cap = cap;
        }
        config.validate()?;
        Ok(config)
    }

    fn csv_format(&self) -> Result<CsvFormat, PriceListError> {
        let delimiter = u8::try_from(self.delimiter).map_err(|_| {
            PriceListError::Config(format!(
                "delimiter {:?} is not a single byte",
                self.delimiter
            ))
        })?;
        Ok(CsvFormat {
            has_headers: self.headers,
            delimiter,
        })
    }
}

fn main() -> Result<(), PriceListError> {
    pricelist::init_tracing("pricelist");
    let cli = Cli::parse();

    if cli.files.is_empty() {
        println!("No input files given, nothing to do.");
        return Ok(());
    }

    let format = cli.csv_format()?;
    let list = PriceList::new(cli.pipeline_config()?);
    info!(files = cli.files.len(), output = %cli.output.display(), "processing price lists");

    let records = list.process_files(&cli.files, format)?;
    list.write(&records, &mut CsvSink::new(&cli.output, format))?;

    info!(records = records.len(), "done");
    Ok(())
}
