//! Append-only processing journal.
//!
//! Every unit transition is written as one JSON line to
//! `<output>/logs/processing_log.jsonl`. Appends never rewrite earlier
//! lines, so a crash loses at most the line being written. Journal failures
//! are logged and otherwise ignored; the journal never fails a unit.

use super::state::UnitState;
use super::unit::{Transition, UnitId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Default journal file name.
pub const JOURNAL_FILE: &str = "processing_log.jsonl";

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub unit_id: String,
    pub request: String,
    pub timestamp: DateTime<Utc>,
    pub from_state: String,
    pub to_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl JournalEntry {
    pub fn from_transition(unit_id: &UnitId, request: &str, transition: &Transition) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            request: request.to_string(),
            timestamp: transition.at,
            from_state: transition.from.name().to_string(),
            to_state: transition.to.name().to_string(),
            reason: match &transition.to {
                UnitState::Failed(reason) => Some(reason.to_string()),
                _ => None,
            },
        }
    }
}

/// Shared writer for the journal file.
#[derive(Debug)]
pub struct ProcessingJournal {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl ProcessingJournal {
    /// Opens (creating if needed) the journal at `path` for appending.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    /// A journal that records nothing.
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry.
    pub fn append(&self, entry: &JournalEntry) {
        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else {
            return;
        };
        let result = serde_json::to_string(entry)
            .map_err(io::Error::other)
            .and_then(|line| writeln!(file, "{}", line));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Failed to append to processing journal");
        }
    }

    /// Records a unit transition.
    pub fn record(&self, unit_id: &UnitId, request: &str, transition: &Transition) {
        self.append(&JournalEntry::from_transition(unit_id, request, transition));
    }

    /// Reads every well-formed entry from a journal file. Malformed lines,
    /// such as a torn final line after a crash, are skipped.
    pub fn read_all(path: &Path) -> io::Result<Vec<JournalEntry>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Ok(entry) = serde_json::from_str(&line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::{FailureKind, FailureReason};
    use tempfile::TempDir;

    fn transition(to: UnitState) -> Transition {
        Transition {
            from: UnitState::Pending,
            to,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join(JOURNAL_FILE);
        let journal = ProcessingJournal::open(&path).unwrap();
        let id = UnitId::new("unit-1");

        journal.record(&id, "chip", &transition(UnitState::Acquiring));
        journal.record(
            &id,
            "chip",
            &transition(UnitState::Failed(FailureReason::new(
                FailureKind::AcquisitionError,
                "no scene",
            ))),
        );

        let entries = ProcessingJournal::read_all(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].to_state, "acquiring");
        assert!(entries[0].reason.is_none());
        assert_eq!(entries[1].to_state, "failed");
        assert_eq!(entries[1].reason.as_deref(), Some("acquisition_error: no scene"));
    }

    #[test]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        let id = UnitId::new("unit-1");

        ProcessingJournal::open(&path)
            .unwrap()
            .record(&id, "chip", &transition(UnitState::Acquiring));
        ProcessingJournal::open(&path)
            .unwrap()
            .record(&id, "chip", &transition(UnitState::Skipped));

        assert_eq!(ProcessingJournal::read_all(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        let journal = ProcessingJournal::open(&path).unwrap();
        journal.record(&UnitId::new("u"), "chip", &transition(UnitState::Skipped));
        drop(journal);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"unit_id\": \"u\", \"req").unwrap();

        assert_eq!(ProcessingJournal::read_all(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_journal_is_silent() {
        let journal = ProcessingJournal::disabled();
        journal.record(&UnitId::new("u"), "chip", &transition(UnitState::Skipped));
    }
}
