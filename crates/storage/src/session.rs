use agentwire_core::{MessageRecord, Paths, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "_type")]
enum LogLine {
    #[serde(rename = "metadata")]
    Metadata {
        session_id: String,
        created_at: String,
    },
    #[serde(untagged)]
    Message(MessageRecord),
}

/// Append-only JSONL log of one session's messages. The first line carries
/// session metadata; every following line is a `MessageRecord`.
pub struct MessageLog {
    paths: Paths,
}

impl MessageLog {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn load(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
        let path = self.paths.session_file(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut messages = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogLine>(&line) {
                Ok(LogLine::Message(record)) => messages.push(record),
                Ok(LogLine::Metadata { .. }) => {}
                Err(e) => {
                    debug!(error = %e, session_id, "Skipping unreadable message log line");
                }
            }
        }
        Ok(messages)
    }

    pub fn append(&self, session_id: &str, record: &MessageRecord) -> Result<()> {
        let path = self.paths.session_file(session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if !path.exists() {
            let mut file = File::create(&path)?;
            let header = LogLine::Metadata {
                session_id: session_id.to_string(),
                created_at: chrono::Utc::now().to_rfc3339(),
            };
            writeln!(file, "{}", serde_json::to_string(&header)?)?;
        }

        let mut file = OpenOptions::new().append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    pub fn clear(&self, session_id: &str) -> Result<()> {
        let path = self.paths.session_file(session_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
