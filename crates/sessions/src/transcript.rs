//! Append-only JSONL transcripts.
//!
//! Each session gets a `<file_stem>.jsonl` file under the sessions
//! directory (the stem is the session key with `:` replaced by `__`).
//! Every message is appended as a single JSON line carrying its turn index.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use valet_domain::error::{Error, Result};
use valet_domain::trace::TraceEvent;

use crate::key::SessionKey;

/// A single transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub timestamp: String,
    pub role: String,
    pub content: String,
    /// Turn index within the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Writes append-only JSONL transcript files.
pub struct TranscriptWriter {
    base_dir: PathBuf,
}

impl TranscriptWriter {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.base_dir.join(format!("{}.jsonl", key.file_stem()))
    }

    /// Append one or more lines to a session's transcript.
    pub fn append(&self, key: &SessionKey, lines: &[TranscriptLine]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        let path = self.path_for(key);
        let mut buf = String::new();
        for line in lines {
            let json = serde_json::to_string(line)
                .map_err(|e| Error::Other(format!("serializing transcript line: {e}")))?;
            buf.push_str(&json);
            buf.push('\n');
        }

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::Io)?;
        file.write_all(buf.as_bytes()).map_err(Error::Io)?;

        TraceEvent::TranscriptAppend {
            session_id: key.to_string(),
            lines: lines.len(),
        }
        .emit();

        Ok(())
    }

    /// Helper to create a transcript line with the current timestamp.
    pub fn line(role: &str, content: &str) -> TranscriptLine {
        TranscriptLine {
            timestamp: Utc::now().to_rfc3339(),
            role: role.to_owned(),
            content: content.to_owned(),
            turn: None,
            metadata: None,
        }
    }

    /// Read back a transcript. Malformed lines are skipped with a warning.
    pub fn read(&self, key: &SessionKey) -> Result<Vec<TranscriptLine>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut lines = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptLine>(line) {
                Ok(tl) => lines.push(tl),
                Err(e) => {
                    tracing::warn!(
                        session_id = %key,
                        error = %e,
                        "skipping malformed transcript line"
                    );
                }
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::new("cli", "local", "me").unwrap()
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());

        let mut l1 = TranscriptWriter::line("user", "hello");
        l1.turn = Some(0);
        let mut l2 = TranscriptWriter::line("assistant", "hi there");
        l2.turn = Some(0);
        writer.append(&key(), &[l1, l2]).unwrap();

        let lines = writer.read(&key()).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].role, "user");
        assert_eq!(lines[1].content, "hi there");
        assert_eq!(lines[0].turn, Some(0));
    }

    #[test]
    fn filename_uses_double_underscores() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer
            .append(&key(), &[TranscriptWriter::line("user", "x")])
            .unwrap();
        assert!(dir.path().join("cli__local__me.jsonl").exists());
    }

    #[test]
    fn read_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        assert!(writer.read(&key()).unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer
            .append(&key(), &[TranscriptWriter::line("user", "good")])
            .unwrap();

        // Corrupt the file with a garbage line.
        use std::io::Write;
        let path = dir.path().join("cli__local__me.jsonl");
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "not json").unwrap();

        let lines = writer.read(&key()).unwrap();
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn empty_append_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer.append(&key(), &[]).unwrap();
        assert!(!dir.path().join("cli__local__me.jsonl").exists());
    }
}
