//! Category-partitioned, daily-rotated NDJSON files.
//!
//! Each category writes to `<dir>/<category>_<YYYY-MM-DD>.log`. The day is
//! taken from the record's own timestamp, so a batch straddling local
//! midnight lands in two files. [`RotatingFileSink::sweep`] removes dated
//! files older than the retention window; the current day plus
//! `retention_days` previous days are kept.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Days, FixedOffset, Local, NaiveDate, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::record::{Category, LogRecord};
use crate::error::InfraError;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug)]
struct ActiveFile {
    day: NaiveDate,
    writer: BufWriter<File>,
}

/// Appends records to per-category, per-day files.
#[derive(Debug)]
pub struct RotatingFileSink {
    dir: PathBuf,
    retention_days: u32,
    offset: Option<FixedOffset>,
    active: HashMap<Category, ActiveFile>,
}

impl RotatingFileSink {
    /// Creates a sink rooted at `dir`, rotating on system local midnight.
    /// The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            dir: dir.into(),
            retention_days,
            offset: None,
            active: HashMap::new(),
        }
    }

    /// Rotates on midnight at a fixed UTC offset instead of system local
    /// time.
    #[must_use]
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Directory holding the files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Calendar day a timestamp belongs to.
    #[must_use]
    pub fn local_day(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        match self.offset {
            Some(offset) => timestamp.with_timezone(&offset).date_naive(),
            None => timestamp.with_timezone(&Local).date_naive(),
        }
    }

    /// Path of the file for a category and day.
    #[must_use]
    pub fn path_for(&self, category: Category, day: NaiveDate) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.log",
            category.as_str(),
            day.format(DATE_FORMAT)
        ))
    }

    /// Appends one record as a JSON line, rotating first if the record
    /// belongs to a different day than the open file. Buffered; call
    /// [`RotatingFileSink::flush`] to persist.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] if the directory or file cannot be
    /// created or written.
    pub async fn append(&mut self, record: &LogRecord) -> Result<(), InfraError> {
        let category = record.category();
        let day = self.local_day(record.timestamp());

        let mut line = serde_json::to_string(record)
            .map_err(|e| InfraError::Io(std::io::Error::other(e)))?;
        line.push('\n');

        let stale = self.active.get(&category).is_some_and(|f| f.day != day);
        if stale && let Some(mut previous) = self.active.remove(&category) {
            previous.writer.flush().await?;
            tracing::debug!(%category, day = %previous.day, "rotated log file");
        }

        let path = self.path_for(category, day);
        let file = match self.active.entry(category) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                fs::create_dir_all(&self.dir).await?;
                let handle = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                entry.insert(ActiveFile {
                    day,
                    writer: BufWriter::new(handle),
                })
            }
        };
        file.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Flushes every open file.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] on the first file that fails to flush.
    pub async fn flush(&mut self) -> Result<(), InfraError> {
        for file in self.active.values_mut() {
            file.writer.flush().await?;
        }
        Ok(())
    }

    /// Flushes and closes every open file.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] if a flush fails. All files are closed
    /// regardless.
    pub async fn close(&mut self) -> Result<(), InfraError> {
        let mut first_error = None;
        for (_, mut file) in self.active.drain() {
            if let Err(e) = file.writer.shutdown().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(InfraError::Io(e)))
    }

    /// Drops any open file handles without flushing, so the next append
    /// reopens from scratch.
    pub fn reset(&mut self) {
        self.active.clear();
    }

    /// Deletes dated log files older than `today - retention_days`.
    /// Files that do not follow the `<category>_<YYYY-MM-DD>.log` shape
    /// are left alone. Returns how many files were removed.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] if the directory cannot be listed. A
    /// missing directory is not an error.
    pub async fn sweep(&self, today: NaiveDate) -> Result<usize, InfraError> {
        let Some(cutoff) = today.checked_sub_days(Days::new(u64::from(self.retention_days))) else {
            return Ok(0);
        };

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(day) = name.to_str().and_then(parse_file_day) else {
                continue;
            };
            if day >= cutoff {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(file = ?entry.path(), error = %e, "failed to remove expired log file");
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, %cutoff, "swept expired log files");
        }
        Ok(removed)
    }
}

fn parse_file_day(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(".log")?;
    let (category, date) = stem.rsplit_once('_')?;
    Category::from_name(category)?;
    NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
}
