//! Part activity log - appends activities to a JSONL file
//!
//! One JSON object per line, tagged with the run id so several runs can
//! share a file.

use crate::io::telemetry::{ActivityPayload, AlertPayload};
use anyhow::Context;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, info};

/// START for activities that open an interval, FINISH for those that close it
pub fn activity_tag(activity: &str) -> &'static str {
    const FINISH_MARKERS: [&str; 4] = ["EXIT", "COMPLETE", "END", "FINISH"];
    if FINISH_MARKERS.iter().any(|m| activity.contains(m)) {
        "FINISH"
    } else {
        "START"
    }
}

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    time: String,
    ts: u64,
    run_id: &'a str,
    cell: &'a str,
    unit: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    part: Option<&'a str>,
    activity: &'a str,
    tag: &'static str,
}

/// Append-only event log writer
pub struct EventLog {
    file_path: String,
    run_id: String,
}

impl EventLog {
    pub fn new(file_path: &str, run_id: &str) -> Self {
        info!(file_path = %file_path, run_id = %run_id, "event_log_initialized");
        Self { file_path: file_path.to_string(), run_id: run_id.to_string() }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Write an activity line; returns true if successful
    pub fn write_activity(&self, activity: &ActivityPayload) -> bool {
        let record = LogRecord {
            time: rfc3339_now(),
            ts: activity.ts,
            run_id: &self.run_id,
            cell: &activity.cell,
            unit: &activity.unit,
            part: activity.part.as_deref(),
            activity: &activity.activity,
            tag: activity_tag(&activity.activity),
        };
        self.write_record(&record)
    }

    /// Alerts are logged as ALERT_<KIND> activities
    pub fn write_alert(&self, alert: &AlertPayload) -> bool {
        let activity = format!("ALERT_{}", alert.kind.to_uppercase());
        let record = LogRecord {
            time: rfc3339_now(),
            ts: alert.ts,
            run_id: &self.run_id,
            cell: &alert.cell,
            unit: alert.unit.as_deref().unwrap_or("CELL"),
            part: alert.part.as_deref(),
            activity: &activity,
            tag: "START",
        };
        self.write_record(&record)
    }

    fn write_record(&self, record: &LogRecord<'_>) -> bool {
        let result = serde_json::to_string(record)
            .context("Failed to serialize event log record")
            .and_then(|line| self.append_line(&line));
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(file = %self.file_path, error = %format!("{:#}", e), "event_log_write_failed");
                false
            }
        }
    }

    /// Append a line, creating parent directories on first use
    fn append_line(&self, line: &str) -> anyhow::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "event_log_written");

        Ok(())
    }
}

fn rfc3339_now() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn activity(unit: &str, part: Option<&str>, activity: &str) -> ActivityPayload {
        ActivityPayload {
            cell: "lab".to_string(),
            ts: 1_700_000_000_000,
            unit: unit.to_string(),
            part: part.map(str::to_string),
            activity: activity.to_string(),
        }
    }

    #[test]
    fn test_activity_tag() {
        assert_eq!(activity_tag("ENTER"), "START");
        assert_eq!(activity_tag("PROCESS_START"), "START");
        assert_eq!(activity_tag("PROCESS_END"), "FINISH");
        assert_eq!(activity_tag("EXIT"), "FINISH");
        assert_eq!(activity_tag("PUSH_COMPLETE"), "FINISH");
        assert_eq!(activity_tag("PUSH_START"), "START");
    }

    #[test]
    fn test_write_activity() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("events.jsonl");
        let log = EventLog::new(file_path.to_str().unwrap(), "run-1");

        assert!(log.write_activity(&activity("S1", Some("P42"), "EXIT")));

        let content = fs::read_to_string(&file_path).unwrap();
        assert!(content.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["run_id"], "run-1");
        assert_eq!(parsed["unit"], "S1");
        assert_eq!(parsed["part"], "P42");
        assert_eq!(parsed["activity"], "EXIT");
        assert_eq!(parsed["tag"], "FINISH");
        assert!(parsed["time"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_write_alert_without_unit() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("events.jsonl");
        let log = EventLog::new(file_path.to_str().unwrap(), "run-1");

        let alert = AlertPayload {
            cell: "lab".to_string(),
            ts: 1,
            kind: "collision_force_reset".to_string(),
            unit: None,
            part: None,
            detail: "grace elapsed".to_string(),
        };
        assert!(log.write_alert(&alert));

        let content = fs::read_to_string(&file_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["unit"], "CELL");
        assert_eq!(parsed["activity"], "ALERT_COLLISION_FORCE_RESET");
        assert!(parsed.get("part").is_none());
    }

    #[test]
    fn test_creates_parent_directories_and_appends() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join("events.jsonl");
        fs::create_dir_all(nested.parent().unwrap()).unwrap();
        fs::write(&nested, "{\"existing\":\"data\"}\n").unwrap();

        let log = EventLog::new(nested.to_str().unwrap(), "run-2");
        log.write_activity(&activity("C1", None, "PUSH_START"));

        let content = fs::read_to_string(&nested).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("existing"));
        assert!(lines[1].contains("PUSH_START"));
    }

    #[test]
    fn test_unwritable_path_reports_failure() {
        let dir = tempdir().unwrap();
        // A directory cannot be opened for append
        let log = EventLog::new(dir.path().to_str().unwrap(), "run-3");
        assert!(!log.write_activity(&activity("S1", None, "ENTER")));
    }
}
