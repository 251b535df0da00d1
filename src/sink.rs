use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use csv::{QuoteStyle, WriterBuilder};
use tracing::{debug, error, warn};

use crate::error::SinkError;
use crate::record::Record;

/// Admitted records waiting for the output store. Holds at most `capacity`
/// records; reaching it flushes before `add` returns.
pub struct BufferedSink {
    path: PathBuf,
    header: Vec<String>,
    delimiter: u8,
    capacity: usize,
    buffer: Vec<Record>,
    flushed: usize,
    header_checked: bool,
}

impl BufferedSink {
    pub fn new(path: impl Into<PathBuf>, header: Vec<String>, capacity: usize, delimiter: u8) -> Self {
        let capacity = capacity.max(1);
        BufferedSink {
            path: path.into(),
            header,
            delimiter,
            capacity,
            buffer: Vec::with_capacity(capacity),
            flushed: 0,
            header_checked: false,
        }
    }

    pub fn add(&mut self, record: Record) -> Result<(), SinkError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.capacity {
            self.flush()?;
        }
        Ok(())
    }

    /// Append every buffered record to the store in one write. The buffer
    /// is empty afterwards either way; on error the records are reported
    /// as lost.
    pub fn flush(&mut self) -> Result<usize, SinkError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let rows = std::mem::take(&mut self.buffer);
        match self.append_rows(&rows) {
            Ok(()) => {
                self.flushed += rows.len();
                debug!("Flushed {} rows to {:?} ({} total)", rows.len(), self.path, self.flushed);
                Ok(rows.len())
            }
            Err(source) => Err(SinkError::Flush {
                path: self.path.clone(),
                lost: rows.len(),
                source,
            }),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn flushed(&self) -> usize {
        self.flushed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_rows(&mut self, rows: &[Record]) -> io::Result<()> {
        let needs_header = match fs::metadata(&self.path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(e),
        };
        if !needs_header && !self.header_checked {
            self.warn_on_header_mismatch();
        }
        self.header_checked = true;

        // Serialize everything first so the file sees a single append.
        let mut writer = WriterBuilder::new()
            .delimiter(self.delimiter)
            .quote_style(QuoteStyle::Necessary)
            .from_writer(Vec::new());
        if needs_header {
            writer.write_record(&self.header)?;
        }
        for row in rows {
            writer.write_record(row.values().map(|v| v.unwrap_or("")))?;
        }
        let bytes = writer.into_inner().map_err(|e| e.into_error())?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        Ok(())
    }

    fn warn_on_header_mismatch(&self) {
        let existing = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .from_path(&self.path)
            .ok()
            .and_then(|mut r| r.records().next())
            .and_then(Result::ok);
        if let Some(existing) = existing {
            if existing.iter().ne(self.header.iter().map(String::as_str)) {
                warn!(
                    "Header of {:?} does not match fields {:?}; appending anyway",
                    self.path, self.header
                );
            }
        }
    }
}

impl Drop for BufferedSink {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Err(e) = self.flush() {
            error!("Flush on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldSpec, RawRecord, RecordSchema};

    fn schema() -> RecordSchema {
        RecordSchema::new(
            vec![FieldSpec::new("title", None), FieldSpec::new("body", None)],
            &["title".to_string()],
        )
        .unwrap()
    }

    fn rec(title: &str, body: &str) -> Record {
        let raw: RawRecord = [
            ("title".to_string(), Some(title.to_string())),
            ("body".to_string(), Some(body.to_string())),
        ]
        .into_iter()
        .collect();
        schema().validate(&raw)
    }

    fn sink(path: &Path, capacity: usize) -> BufferedSink {
        BufferedSink::new(path, schema().field_names(), capacity, b',')
    }

    #[test]
    fn flushes_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut s = sink(&path, 2);

        s.add(rec("A", "1")).unwrap();
        assert!(!path.exists());
        s.add(rec("B", "2")).unwrap();
        assert_eq!(s.buffered(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "title,body\nA,1\nB,2\n");

        s.add(rec("C", "3")).unwrap();
        assert_eq!(s.buffered(), 1);
        assert_eq!(s.flush().unwrap(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "title,body\nA,1\nB,2\nC,3\n");
    }

    #[test]
    fn quotes_special_characters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut s = sink(&path, 10);
        s.add(rec("a,b", "say \"hi\"\nthen leave")).unwrap();
        s.flush().unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "title,body\n\"a,b\",\"say \"\"hi\"\"\nthen leave\"\n"
        );
    }

    #[test]
    fn header_written_once_across_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.csv");

        let mut first = sink(&path, 1);
        first.add(rec("A", "1")).unwrap();
        drop(first);

        let mut second = sink(&path, 1);
        second.add(rec("B", "2")).unwrap();
        second.flush().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("title,body").count(), 1);
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn empty_file_gets_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "").unwrap();
        let mut s = sink(&path, 1);
        s.add(rec("A", "1")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "title,body\nA,1\n");
    }

    #[test]
    fn empty_flush_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut s = sink(&path, 3);
        assert_eq!(s.flush().unwrap(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn drop_flushes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        {
            let mut s = sink(&path, 5);
            s.add(rec("A", "1")).unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "title,body\nA,1\n");
    }

    #[test]
    fn failed_flush_reports_loss() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the append fail.
        let path = dir.path().join("taken");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("x"), "x").unwrap();

        let mut s = sink(&path, 5);
        s.add(rec("A", "1")).unwrap();
        s.add(rec("B", "2")).unwrap();
        match s.flush() {
            Err(SinkError::Flush { lost, .. }) => assert_eq!(lost, 2),
            Ok(_) => panic!("flush into a directory succeeded"),
        }
        assert_eq!(s.buffered(), 0);
    }

    #[test]
    fn tab_delimited() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tsv");
        let mut s = BufferedSink::new(&path, schema().field_names(), 1, b'\t');
        s.add(rec("a\tb", "c")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "title\tbody\n\"a\tb\"\tc\n");
    }
}
