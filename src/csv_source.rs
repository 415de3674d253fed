use crate::record::{Field, Record};
use crate::source::{RecordSource, SourceFactory};
use csv::{Reader, ReaderBuilder, StringRecord};
use std::fs::File;
use tracing::{error, warn};

/// Delimiter and header handling shared by readers and writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvFormat {
    pub has_headers: bool,
    pub delimiter: u8,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self {
            has_headers: false,
            delimiter: b',',
        }
    }
}

/// Column positions of the five record fields within a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns([usize; 5]);

impl Columns {
    fn positional() -> Self {
        Columns([0, 1, 2, 3, 4])
    }

    fn from_headers(headers: &StringRecord) -> Option<Self> {
        let mut positions = [0usize; 5];
        for (slot, field) in positions.iter_mut().zip(Field::ALL) {
            *slot = headers.iter().position(|h| h.trim() == field.header())?;
        }
        Some(Columns(positions))
    }

    fn parse(&self, row: &StringRecord) -> Option<Record> {
        let [id, name, condition, state, price] = self.0;
        let id = row.get(id)?.trim().parse::<i64>().ok()?;
        let price = row.get(price)?.trim().parse::<f32>().ok()?;
        Some(Record::new(
            id,
            row.get(name)?,
            row.get(condition)?,
            row.get(state)?,
            price,
        ))
    }
}

/// Reads records from one CSV file at a time.
pub struct CsvSource {
    format: CsvFormat,
    path: Option<String>,
    reader: Option<Reader<File>>,
    columns: Columns,
    row: StringRecord,
    consumed: u64,
    skipped: u64,
}

impl CsvSource {
    pub fn new(format: CsvFormat) -> Self {
        Self {
            format,
            path: None,
            reader: None,
            columns: Columns::positional(),
            row: StringRecord::new(),
            consumed: 0,
            skipped: 0,
        }
    }

    /// Rows dropped because they did not parse.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn open(&mut self, path: &str) -> Result<(), csv::Error> {
        let mut reader = ReaderBuilder::new()
            .has_headers(self.format.has_headers)
            .delimiter(self.format.delimiter)
            .flexible(true)
            .from_path(path)?;

        self.columns = if self.format.has_headers {
            let headers = reader.headers()?;
            Columns::from_headers(headers).ok_or_else(|| {
                csv::Error::from(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("missing one of the expected headers in {:?}", headers),
                ))
            })?
        } else {
            Columns::positional()
        };
        self.reader = Some(reader);
        Ok(())
    }

    fn set_inactive(&mut self) {
        self.reader = None;
    }
}

impl RecordSource for CsvSource {
    fn bind(&mut self, unit: &str) {
        self.path = Some(unit.to_string());
        self.consumed = 0;
        self.skipped = 0;
        if let Err(e) = self.open(unit) {
            error!(path = unit, error = %e, "cannot open price list");
            self.set_inactive();
        }
    }

    fn has_more(&self) -> bool {
        self.reader.is_some()
    }

    fn next_batch(&mut self, max: usize) -> Vec<Record> {
        let mut batch = Vec::with_capacity(max);
        let Some(reader) = self.reader.as_mut() else {
            return batch;
        };

        let mut failed = false;
        while batch.len() < max {
            match reader.read_record(&mut self.row) {
                Ok(true) => match self.columns.parse(&self.row) {
                    Some(record) => batch.push(record),
                    None => {
                        self.skipped += 1;
                        warn!(path = ?self.path, row = ?self.row, "skipping malformed row");
                    }
                },
                Ok(false) => break,
                Err(e) => {
                    error!(path = ?self.path, error = %e, "read failed, retiring file");
                    failed = true;
                    break;
                }
            }
        }

        if failed || batch.len() < max {
            self.set_inactive();
        }
        self.consumed += batch.len() as u64;
        batch
    }

    fn lines_consumed(&self) -> u64 {
        self.consumed
    }

    fn reset(&mut self) {
        self.path = None;
        self.reader = None;
        self.consumed = 0;
        self.skipped = 0;
    }

    fn unit(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvSourceFactory {
    format: CsvFormat,
}

impl CsvSourceFactory {
    pub fn new(format: CsvFormat) -> Self {
        Self { format }
    }
}

impl SourceFactory for CsvSourceFactory {
    type Source = CsvSource;

    fn create(&self) -> CsvSource {
        CsvSource::new(self.format)
    }
}
