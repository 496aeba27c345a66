//! Append-only progress ledger under `logs_root/`: every consequential
//! scheduler decision is appended to `progress.ndjson` and mirrored into
//! `live.json` as the single most-recent event. Both files are written
//! atomically so a reader never observes a torn write, and appends are
//! safe across concurrent parallel branches.

use crate::events::{RuntimeEvent, RuntimeEventObserver};
use crate::{AttractorError, atomic_io};
use std::path::{Path, PathBuf};

pub const PROGRESS_LEDGER_FILE_NAME: &str = "progress.ndjson";
pub const LIVE_EVENT_FILE_NAME: &str = "live.json";

#[derive(Clone, Debug)]
pub struct ProgressLedger {
    logs_root: PathBuf,
}

impl ProgressLedger {
    pub fn new(logs_root: impl Into<PathBuf>) -> Self {
        Self {
            logs_root: logs_root.into(),
        }
    }

    pub fn progress_path(&self) -> PathBuf {
        self.logs_root.join(PROGRESS_LEDGER_FILE_NAME)
    }

    pub fn live_path(&self) -> PathBuf {
        self.logs_root.join(LIVE_EVENT_FILE_NAME)
    }

    pub fn record(&self, event: &RuntimeEvent) -> Result<(), AttractorError> {
        let line = serde_json::to_string(event).map_err(|error| {
            AttractorError::Runtime(format!("failed to serialize progress event: {error}"))
        })?;
        atomic_io::append_ndjson_line(&self.progress_path(), &line)?;
        atomic_io::write_atomic(&self.live_path(), line.as_bytes())
    }

    /// The most recent event persisted so far, if any.
    pub fn read_live(&self) -> Result<Option<RuntimeEvent>, AttractorError> {
        let path = self.live_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed reading live event '{}': {}",
                path.display(),
                error
            ))
        })?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|error| {
                AttractorError::Runtime(format!("failed parsing live event: {error}"))
            })
    }

    /// Reads every event recorded so far. Intended for tests and the status
    /// CLI's tail view, not the hot path.
    pub fn read_all(&self) -> Result<Vec<RuntimeEvent>, AttractorError> {
        read_progress_events(&self.progress_path())
    }
}

impl RuntimeEventObserver for ProgressLedger {
    fn on_event(&self, event: &RuntimeEvent) {
        if let Err(error) = self.record(event) {
            tracing::warn!(%error, "failed to persist progress event");
        }
    }
}

fn read_progress_events(path: &Path) -> Result<Vec<RuntimeEvent>, AttractorError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path).map_err(|error| {
        AttractorError::Runtime(format!(
            "failed reading progress ledger '{}': {}",
            path.display(),
            error
        ))
    })?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|error| {
                AttractorError::Runtime(format!("malformed progress ledger line: {error}"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PipelineEvent, RuntimeEventKind};
    use tempfile::TempDir;

    fn sample_event(sequence_no: u64) -> RuntimeEvent {
        RuntimeEvent {
            sequence_no,
            timestamp: format!("{sequence_no}.000Z"),
            kind: RuntimeEventKind::Pipeline(PipelineEvent::Started {
                run_id: "run-1".to_string(),
                graph_id: "g".to_string(),
                lineage_attempt: 1,
            }),
        }
    }

    #[test]
    fn record_appends_to_ledger_and_updates_live() {
        let dir = TempDir::new().expect("temp dir should be created");
        let ledger = ProgressLedger::new(dir.path());
        ledger.record(&sample_event(1)).expect("first record should succeed");
        ledger.record(&sample_event(2)).expect("second record should succeed");

        let all = ledger.read_all().expect("ledger should be readable");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].sequence_no, 1);
        assert_eq!(all[1].sequence_no, 2);

        let live = ledger
            .read_live()
            .expect("live should be readable")
            .expect("live event should be present");
        assert_eq!(live.sequence_no, 2);
    }

    #[test]
    fn read_live_missing_file_expected_none() {
        let dir = TempDir::new().expect("temp dir should be created");
        let ledger = ProgressLedger::new(dir.path());
        assert_eq!(ledger.read_live().expect("should not error"), None);
    }
}
