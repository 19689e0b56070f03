//! Trace file parsing: line selection, classification, and record assembly.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::warn;

use crate::frame::{CkcmFrame, OctopylogFrame, PytestembVersion};
use crate::record::{IndexRecord, LogType, RECORD_AUTHOR};

/// Run-scoped metadata merged into every record a file produces.
#[derive(Debug, Clone)]
pub struct ParseContext {
    /// Software version governing the run (may be the literal `unknown`).
    pub version: String,
    /// Lowercased module under test.
    pub module: String,
    /// Octopylog token-layout context; ignored by the ckcm format.
    pub pytestemb: PytestembVersion,
}

/// Reads `path` fully and returns a lazy record sequence over its lines.
///
/// The sequence is restartable by calling `parse_file` again; it is not a
/// reusable in-memory iterator. Lines that fail UTF-8 decoding are logged and
/// skipped without aborting the file.
pub fn parse_file(path: &Path, log_type: LogType, ctx: &ParseContext) -> Result<TraceRecords> {
    let content = std::fs::read(path)
        .with_context(|| format!("failed to read trace file {}", path.display()))?;
    let lines: Vec<Vec<u8>> = content.split(|&b| b == b'\n').map(|l| l.to_vec()).collect();
    Ok(TraceRecords {
        lines: lines.into_iter(),
        log_type,
        test: test_title(path, log_type),
        ctx: ctx.clone(),
    })
}

/// Test title derived from a trace file's base name by stripping the
/// format-specific trailing tokens (two for ckcm, one for octopylog).
pub fn test_title(path: &Path, log_type: LogType) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parts: Vec<&str> = name.split('_').collect();
    let strip = match log_type {
        LogType::Ckcm => 2,
        LogType::Octopylog => 1,
    };
    let keep = parts.len().saturating_sub(strip);
    parts[..keep].join("_")
}

/// Lazy sequence of records produced from one trace file.
pub struct TraceRecords {
    lines: std::vec::IntoIter<Vec<u8>>,
    log_type: LogType,
    test: String,
    ctx: ParseContext,
}

impl TraceRecords {
    /// Title shared by every record of this file.
    pub fn test(&self) -> &str {
        &self.test
    }

    fn is_candidate(&self, line: &[u8]) -> bool {
        match self.log_type {
            LogType::Ckcm => line.first() == Some(&b'['),
            LogType::Octopylog => line.first().is_some_and(|b| b.is_ascii_digit()),
        }
    }

    fn build_record(&self, line: &str) -> IndexRecord {
        let base = IndexRecord {
            author: RECORD_AUTHOR.to_string(),
            test: self.test.clone(),
            version: self.ctx.version.clone(),
            module: self.ctx.module.clone(),
            index_time: Utc::now().to_rfc3339(),
            text: None,
            severity: None,
            library: None,
            at_command: None,
            at_event: None,
            timestamp: None,
        };
        match self.log_type {
            LogType::Ckcm => {
                let frame = CkcmFrame::classify(line);
                IndexRecord {
                    text: Some(frame.raw_text),
                    severity: Some(frame.severity),
                    library: Some(frame.library.to_string()),
                    at_command: frame.at_command,
                    at_event: frame.at_event,
                    ..base
                }
            }
            LogType::Octopylog => {
                let frame = OctopylogFrame::classify(line, &self.ctx.pytestemb);
                IndexRecord {
                    text: frame.message,
                    library: frame.message_type,
                    timestamp: frame.timestamp,
                    ..base
                }
            }
        }
    }
}

impl Iterator for TraceRecords {
    type Item = IndexRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            if !self.is_candidate(&line) {
                continue;
            }
            match std::str::from_utf8(&line) {
                Ok(text) => return Some(self.build_record(text)),
                Err(err) => {
                    warn!(test = %self.test, %err, "skipping undecodable line");
                }
            }
        }
    }
}
