// src/pipeline/event_log.rs
//
// Append-only JSONL event log: one object per line, wall-clock timestamp
// plus simulation time on every entry. Write failures are logged and
// swallowed; in-memory state stays authoritative.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

pub struct EventLogger {
    path: Option<PathBuf>,
}

impl EventLogger {
    pub fn new(path: Option<impl Into<PathBuf>>) -> Self {
        Self {
            path: path.map(Into::into),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Append one event. `kind` is a short snake_case tag, `payload` an
    /// arbitrary JSON object with event-specific fields.
    pub fn log(&self, kind: &str, simulation_time: u64, payload: Value) {
        let Some(path) = &self.path else {
            return;
        };
        let entry = json!({
            "event_id": uuid::Uuid::new_v4().to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "simulation_time": simulation_time,
            "event": kind,
            "payload": payload,
        });
        if let Err(e) = append(path, &entry) {
            warn!("event log write failed: {e}");
        }
    }
}

fn append(path: &PathBuf, entry: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{entry}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[test]
    fn test_entries_carry_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let logger = EventLogger::new(Some(&path));

        logger.log("manual_apply", 17, json!({"command": "NS_GREEN", "duration": 30}));
        logger.log("decision", 20, json!({"method": "fallback"}));

        let file = std::fs::File::open(&path).unwrap();
        let lines: Vec<String> = std::io::BufReader::new(file)
            .lines()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first["event"], "manual_apply");
        assert_eq!(first["simulation_time"], 17);
        assert_eq!(first["payload"]["command"], "NS_GREEN");
        assert!(first["event_id"].as_str().is_some());
        // Wall-clock timestamp parses as RFC 3339
        let ts = first["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_disabled_logger_is_a_no_op() {
        let logger = EventLogger::disabled();
        logger.log("decision", 1, json!({}));
    }
}
