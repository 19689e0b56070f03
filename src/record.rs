//! Indexed document shape and the replaceable index identity.

use clap::ValueEnum;
use serde::Serialize;
use std::fmt;

use crate::frame::Severity;

/// Author stamped on every ingested document.
pub const RECORD_AUTHOR: &str = "jenkins";

/// The two supported trace formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogType {
    /// Bracket-framed ckcm traces.
    Ckcm,
    /// Token-framed octopylog (pytestemb) traces.
    Octopylog,
}

impl LogType {
    /// Lowercase label used in index names and document types.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Ckcm => "ckcm",
            LogType::Octopylog => "octopylog",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One flat document submitted to the search index.
///
/// Field names are part of the persisted contract; absent format-specific
/// fields are omitted from the serialized document rather than emitted as
/// placeholder strings.
#[derive(Debug, Clone, Serialize)]
pub struct IndexRecord {
    /// Fixed author tag.
    pub author: String,
    /// Test title derived from the trace file name.
    pub test: String,
    /// Software version governing the run.
    pub version: String,
    /// Hardware module under test.
    pub module: String,
    /// ISO-8601 timestamp assigned when the record was produced.
    pub index_time: String,
    /// Line payload (ckcm: the full decoded line; octopylog: the message).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Severity level (ckcm only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Originating library (ckcm) or message type (octopylog).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
    /// AT command payload (ckcm, hsti lines only).
    #[serde(rename = "ATCommand", skip_serializing_if = "Option::is_none")]
    pub at_command: Option<String>,
    /// AT event payload (ckcm, hsti lines only).
    #[serde(rename = "ATEvent", skip_serializing_if = "Option::is_none")]
    pub at_event: Option<String>,
    /// Timestamp token (octopylog only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// The tuple naming one replaceable search index.
///
/// Created at the start of an ingestion run and never mutated; two runs
/// sharing an identity target the same index, and the later run supersedes
/// the earlier one's data through the delete-then-create protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexIdentity {
    log_type: LogType,
    version: String,
    module: String,
    config: String,
    build_number: String,
}

impl IndexIdentity {
    /// Builds a new identity; components are normalized to lowercase.
    pub fn new(
        log_type: LogType,
        version: &str,
        module: &str,
        config: &str,
        build_number: &str,
    ) -> Self {
        Self {
            log_type,
            version: version.to_lowercase(),
            module: module.to_lowercase(),
            config: config.to_lowercase(),
            build_number: build_number.to_lowercase(),
        }
    }

    /// Trace format this identity covers.
    pub fn log_type(&self) -> LogType {
        self.log_type
    }

    /// Normalized version component.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Normalized module component.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Index name: the lowercased components joined with underscores.
    pub fn index_name(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.log_type.as_str(),
            self.version,
            self.module,
            self.config,
            self.build_number
        )
    }
}

impl fmt::Display for IndexIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.index_name())
    }
}
