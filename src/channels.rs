//! Source-ingestion and reporting-channel capability traits, and the local
//! adapters the bot ships with. Downstream code depends only on
//! [`SourceChannel`]/[`ReportingChannel`] rather than a live chat SDK, the
//! same way the rest of the bot depends only on `ExchangeClient` rather
//! than a specific exchange.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::ingestion::RawMessage;
use crate::models::Correlation;
use crate::telemetry::TelemetryLogger;

/// A place signals arrive from. `poll` is called on a fixed interval and
/// returns whatever new messages have shown up since the last call.
pub trait SourceChannel: Send + Sync {
    fn name(&self) -> &str;
    fn poll(&self) -> anyhow::Result<Vec<RawMessage>>;
}

/// A place reports and alerts go out to. Returns the sent message's id when
/// the underlying transport assigns one.
#[async_trait::async_trait]
pub trait ReportingChannel: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str) -> anyhow::Result<Option<String>>;
}

#[derive(Deserialize)]
struct FileSourceRecord {
    chat_id: String,
    message_id: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    raw_text: String,
}

/// Tails a newline-delimited JSON file of `{chat_id, message_id, timestamp,
/// raw_text}` records, remembering a byte offset so the same line is never
/// returned twice. Malformed lines are skipped rather than failing the poll.
pub struct FileSourceChannel {
    name: String,
    path: String,
    offset: Mutex<u64>,
}

impl FileSourceChannel {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self { name: name.into(), path: path.into(), offset: Mutex::new(0) }
    }
}

impl SourceChannel for FileSourceChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&self) -> anyhow::Result<Vec<RawMessage>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut offset = self.offset.lock();
        file.seek(SeekFrom::Start(*offset))?;
        let reader = BufReader::new(&file);

        let mut messages = Vec::new();
        let mut bytes_read: u64 = 0;
        for line in reader.lines() {
            let line = line?;
            bytes_read += line.len() as u64 + 1;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<FileSourceRecord>(&line) else {
                continue;
            };
            messages.push(RawMessage {
                source: self.name.clone(),
                chat_id: record.chat_id,
                message_id: record.message_id,
                message_ts: record.timestamp,
                raw_text: record.raw_text,
            });
        }
        *offset += bytes_read;
        Ok(messages)
    }
}

/// Writes report/alert text to `tracing` and the telemetry log instead of a
/// live chat API. The one shipped `ReportingChannel`.
pub struct LoggingReportingChannel {
    telemetry: Arc<TelemetryLogger>,
}

impl LoggingReportingChannel {
    pub fn new(telemetry: Arc<TelemetryLogger>) -> Self {
        Self { telemetry }
    }
}

#[async_trait::async_trait]
impl ReportingChannel for LoggingReportingChannel {
    async fn send_text(&self, chat_id: &str, text: &str) -> anyhow::Result<Option<String>> {
        tracing::info!(chat_id = %chat_id, "{}", text);
        self.telemetry.info(
            "REPORT_SENT",
            "reporter",
            text,
            &Correlation { source_chat_id: Some(chat_id.to_string()), ..Default::default() },
            serde_json::json!({}),
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_source_channel_only_returns_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.jsonl");
        {
            let mut f = File::create(&path).unwrap();
            writeln!(f, r#"{{"chat_id":"1","message_id":"a","raw_text":"hello"}}"#).unwrap();
        }
        let channel = FileSourceChannel::new("file", path.to_str().unwrap());
        let first = channel.poll().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].raw_text, "hello");

        let again = channel.poll().unwrap();
        assert!(again.is_empty());

        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, r#"{{"chat_id":"1","message_id":"b","raw_text":"world"}}"#).unwrap();
        }
        let second = channel.poll().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, "b");
    }

    #[test]
    fn file_source_channel_missing_file_returns_empty() {
        let channel = FileSourceChannel::new("file", "/nonexistent/path/messages.jsonl");
        assert!(channel.poll().unwrap().is_empty());
    }

    #[test]
    fn file_source_channel_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.jsonl");
        {
            let mut f = File::create(&path).unwrap();
            writeln!(f, "not json").unwrap();
            writeln!(f, r#"{{"chat_id":"1","message_id":"a","raw_text":"hello"}}"#).unwrap();
        }
        let channel = FileSourceChannel::new("file", path.to_str().unwrap());
        let messages = channel.poll().unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn logging_reporting_channel_never_errors() {
        let telemetry = Arc::new(TelemetryLogger::new(
            std::env::temp_dir().join("channels-test-telemetry.jsonl").to_str().unwrap(),
            "test",
            "test",
        ).unwrap());
        let channel = LoggingReportingChannel::new(telemetry);
        let result = channel.send_text("1", "daily report").await.unwrap();
        assert!(result.is_none());
    }
}
