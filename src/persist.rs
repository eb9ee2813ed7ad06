use crate::record::{CompleteRecord, Template};
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

// Batches completed records and flushes them to an append-only CSV sink.
// Records stay queued in arrival order; a failed flush keeps them pending
// so the next attempt retries instead of dropping data.
pub struct PersistenceBuffer {
    path: PathBuf,
    file: File,
    pending: Vec<CompleteRecord>,
    flush_threshold: usize,
    written: u64,
}

impl PersistenceBuffer {
    // Create the sink and write the header line. Failure here is fatal for
    // the pipeline: a run without a working sink should not start.
    pub fn create(path: &Path, template: &Template, flush_threshold: usize) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("opening record output failed: {}", path.display()))?;

        let header = CompleteRecord::csv_header(template);
        writeln!(file, "{header}")
            .with_context(|| format!("writing CSV header failed: {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            pending: Vec::new(),
            flush_threshold: flush_threshold.max(1),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    // Queue one record; flushes automatically once the batch threshold is
    // reached.
    pub fn push(&mut self, record: CompleteRecord) -> Result<()> {
        self.pending.push(record);
        if self.pending.len() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    // Write every pending record in arrival order. The batch is cleared only
    // after the whole write succeeded.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut block = String::new();
        for record in &self.pending {
            block.push_str(&record.csv_row());
            block.push('\n');
        }

        self.file
            .write_all(block.as_bytes())
            .and_then(|()| self.file.flush())
            .with_context(|| format!("writing records failed: {}", self.path.display()))?;

        self.written += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }
}
