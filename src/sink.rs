use crate::PriceListError;
use crate::csv_source::CsvFormat;
use crate::record::{Field, Record};
use csv::WriterBuilder;
use std::path::{Path, PathBuf};
use tracing::info;

/// Receives the final ordered snapshot.
pub trait OutputSink {
    fn write(&mut self, records: &[Record], fields: &[Field]) -> Result<(), PriceListError>;
}

/// Writes the snapshot as a CSV file.
pub struct CsvSink {
    path: PathBuf,
    format: CsvFormat,
}

impl CsvSink {
    pub fn new(path: impl AsRef<Path>, format: CsvFormat) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            format,
        }
    }
}

impl OutputSink for CsvSink {
    fn write(&mut self, records: &[Record], fields: &[Field]) -> Result<(), PriceListError> {
        let mut writer = WriterBuilder::new()
            .delimiter(self.format.delimiter)
            .from_path(&self.path)?;

        if self.format.has_headers {
            writer.write_record(fields.iter().map(|f| f.header()))?;
        }
        for record in records {
            writer.write_record(fields.iter().map(|f| record.field_value(*f)))?;
        }
        writer.flush()?;

        info!(path = %self.path.display(), records = records.len(), "result written");
        Ok(())
    }
}

/// Collects snapshots in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub rows: Vec<Vec<String>>,
}

impl OutputSink for MemorySink {
    fn write(&mut self, records: &[Record], fields: &[Field]) -> Result<(), PriceListError> {
        self.rows = records
            .iter()
            .map(|r| fields.iter().map(|f| r.field_value(*f)).collect())
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_sink_writes_headers_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut sink = CsvSink::new(&path, CsvFormat { has_headers: true, delimiter: b',' });

        let records = vec![
            Record::new(1, "lamp", "new", "ok", 1.5),
            Record::new(2, "desk", "used", "ok", 20.0),
        ];
        sink.write(&records, &Field::ALL).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "product ID,Name,Condition,State,Price");
        assert_eq!(lines[1], "1,lamp,new,ok,1.5");
        assert_eq!(lines[2], "2,desk,used,ok,20");
    }

    #[test]
    fn test_field_order_is_respected() {
        let mut sink = MemorySink::default();
        let records = vec![Record::new(3, "sofa", "new", "ok", 99.0)];
        sink.write(&records, &[Field::Price, Field::Id]).unwrap();
        assert_eq!(sink.rows, vec![vec!["99".to_string(), "3".to_string()]]);
    }
}
