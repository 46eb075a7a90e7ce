use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context as _, Result};
use fs_err::{self as fs, File, OpenOptions};
use tracing::{error, info, trace, warn};

use crate::types::TxRequest;

/// Append-only transaction log, one text record per line.
///
/// Opened once at startup and never rewritten in place. Each append writes one complete line with
/// a single write call and syncs it before returning.
pub struct WriteAheadLog {
    file_path: PathBuf,
    file: Option<File>,
    appended: u64,
}

impl WriteAheadLog {
    pub fn open<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;

        info!("Opened WAL file: {:?}", file_path);
        Ok(Self {
            file_path,
            file: Some(file),
            appended: 0,
        })
    }

    pub fn append(&mut self, req: &TxRequest) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("WAL is closed"))?;

        let mut line = req.to_record();
        line.push('\n');
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append tx {} to WAL", req.tx_id))?;
        file.sync_data()?;

        self.appended += 1;
        trace!(tx_id = req.tx_id, "Wrote WAL record");
        Ok(())
    }

    /// Read every record back, skipping lines that do not parse.
    pub fn read_records<P: AsRef<Path>>(file_path: P) -> Result<Vec<TxRequest>> {
        let file_path = file_path.as_ref();
        let reader = BufReader::new(File::open(file_path)?);
        let mut records = Vec::new();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line.context("Failed to read WAL line")?;
            if line.trim().is_empty() {
                continue;
            }
            match TxRequest::parse_record(&line) {
                Ok(req) => records.push(req),
                Err(e) => warn!("Skipping malformed WAL line {}: {e}", lineno + 1),
            }
        }

        info!("Read {} records from WAL: {:?}", records.len(), file_path);
        Ok(records)
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
            info!(
                "Closed WAL: {:?} ({} records appended)",
                self.file_path, self.appended
            );
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Error closing WAL in drop: {e}");
        }
    }
}
