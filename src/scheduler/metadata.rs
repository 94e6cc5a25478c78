//! Append-only JSON array of repository records.
//!
//! The file is opened with `[`, every record is appended as `<json>,\n` and
//! flushed immediately, so an interrupted run leaves a file that only needs
//! its closing bracket. [`MetadataLog::close`] strips the trailing comma and
//! writes `]`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::repo::RepositoryRecord;

/// Writer for the metadata log.
#[derive(Debug)]
pub struct MetadataLog {
    path: PathBuf,
    writer: BufWriter<File>,
    entries: usize,
}

impl MetadataLog {
    /// Create (truncating) the log and write the opening bracket.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .read(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(b"[")?;
        writer.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            entries: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Append one record.
    pub fn append(&mut self, record: &RepositoryRecord) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b",\n")?;
        self.writer.flush()?;
        self.entries += 1;
        Ok(())
    }

    /// Terminate the array. The result is valid JSON (`[]` when empty).
    pub fn close(mut self) -> std::io::Result<()> {
        self.writer.flush()?;
        let mut file = self.writer.into_inner().map_err(|e| e.into_error())?;
        if self.entries > 0 {
            // Drop the trailing ",\n" of the last record.
            let len = file.seek(SeekFrom::End(0))?;
            file.set_len(len.saturating_sub(2))?;
            file.seek(SeekFrom::End(0))?;
        }
        file.write_all(b"]")?;
        file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::ObfuscationVariant;

    #[test]
    fn test_empty_log_is_empty_array() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta_data.json");
        let log = MetadataLog::create(&path).expect("create");
        assert!(log.is_empty());
        log.close().expect("close");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "[]");
    }

    #[test]
    fn test_records_form_valid_json_array() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out/meta_data.json");
        let mut log = MetadataLog::create(&path).expect("create");

        let mut record = RepositoryRecord::new(0, "a", "b");
        log.append(&record).expect("append");
        record.obfuscation = ObfuscationVariant::LlvmSub;
        record.num_binaries = 7;
        log.append(&record).expect("append");
        assert_eq!(log.len(), 2);

        // Readable before close: only the closing bracket is missing.
        let partial = std::fs::read_to_string(&path).expect("read");
        assert!(partial.starts_with("[{"));
        assert!(partial.ends_with("},\n"));

        log.close().expect("close");
        let content = std::fs::read_to_string(&path).expect("read");
        let parsed: Vec<RepositoryRecord> = serde_json::from_str(&content).expect("valid json");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].obfuscation, ObfuscationVariant::LlvmSub);
        assert_eq!(parsed[1].num_binaries, 7);
    }

    #[test]
    fn test_create_truncates_previous_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta_data.json");
        std::fs::write(&path, "[{\"stale\": true},\n").expect("write");
        MetadataLog::create(&path).expect("create").close().expect("close");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "[]");
    }
}
