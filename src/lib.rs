#![warn(missing_docs)]
//! Core library entry points for the traceload ingestion pipeline.

pub mod archive;
pub mod frame;
pub mod parser;
pub mod pipeline;
pub mod probe;
pub mod record;
pub mod search;

pub use archive::{extract_archive, fetch_archive, working_file_name, BuildJob, ExtractError};
pub use frame::{CkcmFrame, OctopylogFrame, PytestembVersion, Severity};
pub use parser::{parse_file, test_title, ParseContext, TraceRecords};
pub use pipeline::{run as run_ingestion, PipelineConfig, RunError, RunReport, Stage};
pub use probe::{package_version, pytestemb_version, VERSION_UNKNOWN};
pub use record::{IndexIdentity, IndexRecord, LogType, RECORD_AUTHOR};
pub use search::{BulkOutcome, IndexReplacer, ReplaceReport, SearchClient};
