//! Append-only JSONL telemetry log — the reporting source of truth, distinct
//! from `tracing` log lines. Every stage emits through this module; the
//! Reporter (Stage 6) reads it back and aggregates windows from it.
//!
//! Mirrors the original Python `TelemetryLogger`: a stable `event_key` hash
//! for downstream dedup, recursive key redaction for secrets, and a
//! never-raises contract so a disk hiccup never takes down a worker loop.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::models::Correlation;

const REDACTED_KEYS: &[&str] = &[
    "api_key",
    "apikey",
    "secret",
    "secret_key",
    "signature",
    "authorization",
    "auth",
    "token",
    "password",
    "private_key",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

pub struct TelemetryLogger {
    path: PathBuf,
    file: Mutex<std::fs::File>,
    bot_name: String,
    env_name: String,
}

impl TelemetryLogger {
    pub fn new(path: &str, bot_name: &str, env_name: &str) -> anyhow::Result<Self> {
        if let Some(parent) = PathBuf::from(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file: Mutex::new(file),
            bot_name: bot_name.to_string(),
            env_name: env_name.to_string(),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Emit an event. Never returns an error to the caller — a write
    /// failure is logged via `tracing` and swallowed, matching the
    /// telemetry-never-raises contract in the error handling design.
    pub fn emit(
        &self,
        event_type: &str,
        level: Level,
        subsystem: &str,
        message: &str,
        correlation: &Correlation,
        payload: Value,
    ) {
        let event_key = stable_event_key(event_type, subsystem, correlation, message);
        self.emit_with_key(event_type, level, subsystem, message, correlation, payload, event_key);
    }

    /// Same as [`emit`](Self::emit) but with a caller-supplied `event_key`,
    /// for events whose natural dedup key differs from the default hash
    /// (e.g. a reporter window that should key on the window bounds).
    pub fn emit_with_key(
        &self,
        event_type: &str,
        level: Level,
        subsystem: &str,
        message: &str,
        correlation: &Correlation,
        payload: Value,
        event_key: String,
    ) {
        let record = json!({
            "ts_utc": Utc::now().to_rfc3339(),
            "event_type": event_type,
            "level": level.as_str(),
            "subsystem": subsystem,
            "message": message,
            "event_key": event_key,
            "bot": self.bot_name,
            "env": self.env_name,
            "correlation": correlation,
            "payload": redact(&payload),
        });

        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, "telemetry: failed to serialize event");
                return;
            }
        };

        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{line}") {
            tracing::error!(error = %e, "telemetry: failed to write event");
        }
    }

    pub fn info(&self, event_type: &str, subsystem: &str, message: &str, correlation: &Correlation, payload: Value) {
        self.emit(event_type, Level::Info, subsystem, message, correlation, payload);
    }

    pub fn warning(&self, event_type: &str, subsystem: &str, message: &str, correlation: &Correlation, payload: Value) {
        self.emit(event_type, Level::Warning, subsystem, message, correlation, payload);
    }

    pub fn error(&self, event_type: &str, subsystem: &str, message: &str, correlation: &Correlation, payload: Value) {
        self.emit(event_type, Level::Error, subsystem, message, correlation, payload);
    }

    /// Tail the JSONL file and parse every well-formed line, for the
    /// Reporter's windowed aggregation. Malformed trailing lines (a crash
    /// mid-write) are skipped rather than aborting the read.
    pub fn read_all(&self) -> Vec<Value> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter_map(|l| serde_json::from_str::<Value>(l).ok())
            .collect()
    }

    pub fn read_since(&self, since: DateTime<Utc>) -> Vec<Value> {
        self.read_all()
            .into_iter()
            .filter(|v| {
                v.get("ts_utc")
                    .and_then(|t| t.as_str())
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc) >= since)
                    .unwrap_or(false)
            })
            .collect()
    }
}

fn stable_event_key(event_type: &str, subsystem: &str, correlation: &Correlation, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    hasher.update(b"|");
    hasher.update(subsystem.as_bytes());
    hasher.update(b"|");
    hasher.update(serde_json::to_string(correlation).unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(message.as_bytes());
    hex::encode(hasher.finalize())
}

fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if REDACTED_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                    out.insert(k.clone(), Value::String(mask(v)));
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

fn mask(value: &Value) -> String {
    let s = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if s.len() <= 6 {
        "***".to_string()
    } else {
        format!("{}***{}", &s[..4], &s[s.len() - 2..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn emit_writes_jsonl_line_and_redacts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("telemetry.jsonl");
        let logger = TelemetryLogger::new(path.to_str().unwrap(), "testbot", "test").unwrap();

        logger.info(
            "ORDER_PLACED",
            "executor",
            "placed entry order",
            &Correlation { ssot_id: Some(1), ..Default::default() },
            json!({"api_key": "abcdef123456", "price": "100.00"}),
        );

        let events = logger.read_all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event_type"], "ORDER_PLACED");
        assert_eq!(events[0]["payload"]["api_key"], "abcd***56");
        assert_eq!(events[0]["payload"]["price"], "100.00");
        assert!(events[0]["event_key"].as_str().unwrap().len() == 64);
    }

    #[test]
    fn event_key_stable_for_identical_inputs() {
        let k1 = stable_event_key("X", "sub", &Correlation::default(), "msg");
        let k2 = stable_event_key("X", "sub", &Correlation::default(), "msg");
        assert_eq!(k1, k2);
    }
}
