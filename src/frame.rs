//! Line classification for the two embedded-test trace formats.

use serde::Serialize;

/// Marker terminating the payload portion of a ckcm line.
const LINE_FEED_MARKER: &str = "<LF>";

/// Fixed-vocabulary log level carried by a ckcm line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational message.
    Info,
    /// Error message.
    Error,
    /// Warning message.
    Warning,
    /// Debug message.
    Debug,
    /// Verbose trace message.
    Verbose,
    /// Critical failure message.
    Critical,
    /// Marker character absent or outside the mapped vocabulary.
    Unknown,
}

impl Severity {
    /// Lowercase label used in indexed documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Debug => "debug",
            Severity::Verbose => "verbose",
            Severity::Critical => "critical",
            Severity::Unknown => "unknown",
        }
    }

    fn from_marker(marker: char) -> Self {
        match marker.to_ascii_lowercase() {
            'i' => Severity::Info,
            'e' => Severity::Error,
            'w' => Severity::Warning,
            'd' => Severity::Debug,
            'v' => Severity::Verbose,
            'c' => Severity::Critical,
            _ => Severity::Unknown,
        }
    }
}

/// Library label assigned to lines matching no marker at all.
pub const LIBRARY_UNKNOWN: &str = "unknown";

const BLUES_MARKERS: &[&str] = &["]BT", "rt_postBlues", "Blues"];
const RAP_MARKERS: &[&str] = &["]RAP", "]SIVR"];
const HIPHOP_MARKERS: &[&str] = &["]HSTI", "SoftAT_", "HIPHOP"];

/// Ordered rule groups for library classification. Groups are folded
/// left-to-right; within a group the first matching entry applies, and a
/// matching group overwrites the result of any earlier group. The resulting
/// overlap (a rap marker clobbers tala, a hiphop marker clobbers rap) is the
/// historical behavior and is preserved, not corrected.
const LIBRARY_RULES: &[&[(&[&str], &str)]] = &[
    &[(BLUES_MARKERS, "blues"), (&["]HSTI"], "hsti")],
    &[(RAP_MARKERS, "rap")],
    &[
        (HIPHOP_MARKERS, "hiphop"),
        (&["]TALA"], "tala"),
        (&["]TANGO"], "tango"),
        (&["]SOP"], "soprano"),
        (&["]CCTOS"], "concertos"),
        (&["]DISCO"], "disco"),
        (&["]SOUL"], "soul"),
        (&["wxCKCM"], "wxCKCM"),
    ],
];

/// One classified line of the ckcm trace format.
///
/// Every derived field is a pure function of `raw_text`, computed eagerly at
/// construction in a fixed order (severity, library, event, command) since the
/// AT fields read the library result.
#[derive(Debug, Clone)]
pub struct CkcmFrame {
    /// The decoded line, unmodified.
    pub raw_text: String,
    /// Log level derived from the fifth bracket-delimited segment.
    pub severity: Severity,
    /// Originating library, or [`LIBRARY_UNKNOWN`].
    pub library: &'static str,
    /// AT command payload, populated only for `hsti` lines.
    pub at_command: Option<String>,
    /// AT event payload, populated only for `hsti` lines.
    pub at_event: Option<String>,
}

impl CkcmFrame {
    /// Classifies one raw ckcm line.
    pub fn classify(raw_line: &str) -> Self {
        let severity = classify_severity(raw_line);
        let library = classify_library(raw_line);
        let at_event = (library == "hsti")
            .then(|| classify_event(raw_line))
            .flatten();
        let at_command = (library == "hsti")
            .then(|| classify_command(raw_line))
            .flatten();
        Self {
            raw_text: raw_line.to_string(),
            severity,
            library,
            at_command,
            at_event,
        }
    }
}

fn classify_severity(line: &str) -> Severity {
    line.split('[')
        .nth(4)
        .and_then(|segment| segment.chars().next())
        .map(Severity::from_marker)
        .unwrap_or(Severity::Unknown)
}

fn classify_library(line: &str) -> &'static str {
    let mut library = LIBRARY_UNKNOWN;
    for group in LIBRARY_RULES {
        for (markers, label) in group.iter().copied() {
            if markers.iter().any(|marker| line.contains(marker)) {
                library = label;
                break;
            }
        }
    }
    library
}

fn classify_command(line: &str) -> Option<String> {
    field_after(line, "WaitCmdAT")
}

fn classify_event(line: &str) -> Option<String> {
    field_after(line, "WaitCmd").or_else(|| field_after(line, "HSTIRapEvent"))
}

/// Text between the end of `marker` and the terminal `<LF>` of the line.
/// A missing marker or a missing terminator yields `None`, never an error.
fn field_after(line: &str, marker: &str) -> Option<String> {
    let start = line.find(marker)? + marker.len();
    let rest = &line[start..];
    let end = rest.rfind(LINE_FEED_MARKER)?;
    Some(rest[..end].to_string())
}

/// Parsed pytestemb library version governing octopylog token layout.
///
/// Parsed once per frame set, not per line: versions 2.2 and later moved the
/// timestamp two tokens to the right, and `first_field_offset` captures that
/// schema change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PytestembVersion {
    major: u32,
    minor: u32,
    first_field_offset: usize,
}

impl PytestembVersion {
    /// Builds a version context from explicit components.
    pub fn new(major: u32, minor: u32) -> Self {
        let first_field_offset = if major >= 2 && minor >= 2 { 2 } else { 0 };
        Self {
            major,
            minor,
            first_field_offset,
        }
    }

    /// Parses a dotted version string such as `2.3` or `2.3.1`.
    /// Returns `None` when the first two components are not integers.
    pub fn parse(version: &str) -> Option<Self> {
        let mut parts = version.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some(Self::new(major, minor))
    }

    /// Token index of the timestamp field for this version.
    pub fn first_field_offset(&self) -> usize {
        self.first_field_offset
    }
}

/// One classified line of the octopylog trace format.
///
/// Lines not starting with a decimal digit carry no record data; all three
/// derived fields stay absent. Lines with too few whitespace-delimited tokens
/// are tolerated the same way.
#[derive(Debug, Clone)]
pub struct OctopylogFrame {
    /// The decoded line, unmodified.
    pub raw_text: String,
    /// Timestamp token.
    pub timestamp: Option<String>,
    /// Message type token.
    pub message_type: Option<String>,
    /// Remaining tokens rejoined with single spaces.
    pub message: Option<String>,
}

impl OctopylogFrame {
    /// Classifies one raw octopylog line under the given version context.
    pub fn classify(raw_line: &str, version: &PytestembVersion) -> Self {
        if !raw_line.starts_with(|c: char| c.is_ascii_digit()) {
            return Self {
                raw_text: raw_line.to_string(),
                timestamp: None,
                message_type: None,
                message: None,
            };
        }

        let offset = version.first_field_offset();
        let tokens: Vec<&str> = raw_line.split_whitespace().collect();
        let timestamp = tokens.get(offset).map(|t| t.to_string());
        let message_type = tokens.get(offset + 1).map(|t| t.to_string());
        let message = if tokens.len() > offset + 2 {
            Some(tokens[offset + 2..].join(" "))
        } else {
            None
        };

        Self {
            raw_text: raw_line.to_string(),
            timestamp,
            message_type,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_maps_marker_characters() {
        let cases = [
            ('I', Severity::Info),
            ('e', Severity::Error),
            ('W', Severity::Warning),
            ('d', Severity::Debug),
            ('v', Severity::Verbose),
            ('c', Severity::Critical),
        ];
        for (marker, expected) in cases {
            let line = format!("[12:00:00.1][main][ ][{marker}nfo]]TALA ready");
            assert_eq!(classify_severity(&line), expected, "marker {marker}");
        }
    }

    #[test]
    fn severity_unknown_for_unmapped_or_short_lines() {
        assert_eq!(
            classify_severity("[12:00:00.1][main][ ][Xyz] text"),
            Severity::Unknown
        );
        assert_eq!(classify_severity("[12:00:00.1][Info]"), Severity::Unknown);
        assert_eq!(classify_severity("no brackets at all"), Severity::Unknown);
    }

    #[test]
    fn classifies_severity_and_library_together() {
        let frame = CkcmFrame::classify("[12:00:00.1][main][ ][Info]]RAP cmd<LF>");
        assert_eq!(frame.severity, Severity::Info);
        assert_eq!(frame.library, "rap");
        assert!(frame.at_command.is_none());
        assert!(frame.at_event.is_none());
    }

    #[test]
    fn single_marker_lines_map_to_their_library() {
        let cases = [
            ("]BT connected", "blues"),
            ("rt_postBlues queued", "blues"),
            ("]SIVR session", "rap"),
            ("]TALA ready", "tala"),
            ("]TANGO step", "tango"),
            ("]SOP note", "soprano"),
            ("]CCTOS tick", "concertos"),
            ("]DISCO beat", "disco"),
            ("]SOUL groove", "soul"),
            ("wxCKCM boot", "wxCKCM"),
            ("SoftAT_ping", "hiphop"),
            ("nothing to see", LIBRARY_UNKNOWN),
        ];
        for (line, expected) in cases {
            assert_eq!(classify_library(line), expected, "line {line:?}");
        }
    }

    #[test]
    fn rap_marker_overwrites_tala() {
        assert_eq!(classify_library("]RAP with ]TALA trailer"), "rap");
    }

    #[test]
    fn hiphop_chain_overwrites_rap() {
        assert_eq!(classify_library("HIPHOP frame over ]RAP link"), "hiphop");
        assert_eq!(classify_library("SoftAT_cmd via ]SIVR"), "hiphop");
    }

    #[test]
    fn hsti_marker_resolves_to_hiphop() {
        // ]HSTI appears in both the hsti rule and the hiphop group; the later
        // group wins, so plain hsti is unreachable from classification.
        assert_eq!(classify_library("]HSTI WaitCmdAT+CFUN=1<LF>"), "hiphop");
        let frame = CkcmFrame::classify("[a][b][c][Info]]HSTI WaitCmdAT+CFUN=1<LF>");
        assert_eq!(frame.library, "hiphop");
        assert!(frame.at_command.is_none());
    }

    #[test]
    fn at_fields_extract_up_to_terminal_line_feed() {
        assert_eq!(
            classify_command("]HSTI WaitCmdAT+CFUN=1<LF>"),
            Some("+CFUN=1".to_string())
        );
        assert_eq!(
            classify_event("]HSTI WaitCmdAT+CFUN=1<LF>"),
            Some("AT+CFUN=1".to_string())
        );
        assert_eq!(
            classify_event("]HSTI HSTIRapEvent:RING<LF>"),
            Some(":RING".to_string())
        );
        // Missing terminator leaves the field absent rather than failing.
        assert_eq!(classify_command("]HSTI WaitCmdAT+CFUN=1"), None);
        assert_eq!(classify_event("]HSTI plain text<LF>"), None);
    }

    #[test]
    fn first_field_offset_requires_both_components_at_least_two() {
        assert_eq!(PytestembVersion::new(2, 2).first_field_offset(), 2);
        assert_eq!(PytestembVersion::new(2, 3).first_field_offset(), 2);
        assert_eq!(PytestembVersion::new(1, 9).first_field_offset(), 0);
        assert_eq!(PytestembVersion::new(2, 1).first_field_offset(), 0);
        // A 3.1 release fails the minor check; the historical rule compares
        // both components independently.
        assert_eq!(PytestembVersion::new(3, 1).first_field_offset(), 0);
    }

    #[test]
    fn parses_dotted_version_strings() {
        assert_eq!(
            PytestembVersion::parse("2.3"),
            Some(PytestembVersion::new(2, 3))
        );
        assert_eq!(
            PytestembVersion::parse("2.3.1"),
            Some(PytestembVersion::new(2, 3))
        );
        assert_eq!(PytestembVersion::parse("2"), None);
        assert_eq!(PytestembVersion::parse("two.three"), None);
    }

    #[test]
    fn octopylog_non_digit_lines_yield_absent_fields() {
        let version = PytestembVersion::new(2, 3);
        let frame = OctopylogFrame::classify("INFO 100 late start", &version);
        assert!(frame.timestamp.is_none());
        assert!(frame.message_type.is_none());
        assert!(frame.message.is_none());

        let empty = OctopylogFrame::classify("", &version);
        assert!(empty.timestamp.is_none());
    }

    #[test]
    fn octopylog_tokens_shift_with_offset() {
        let line = "100 200 INFO hello world";

        let old = OctopylogFrame::classify(line, &PytestembVersion::new(1, 9));
        assert_eq!(old.timestamp.as_deref(), Some("100"));
        assert_eq!(old.message_type.as_deref(), Some("200"));
        assert_eq!(old.message.as_deref(), Some("INFO hello world"));

        let new = OctopylogFrame::classify(line, &PytestembVersion::new(2, 3));
        assert_eq!(new.timestamp.as_deref(), Some("INFO"));
        assert_eq!(new.message_type.as_deref(), Some("hello"));
        assert_eq!(new.message.as_deref(), Some("world"));
    }

    #[test]
    fn octopylog_short_lines_leave_missing_fields_absent() {
        let version = PytestembVersion::new(1, 9);
        let frame = OctopylogFrame::classify("100", &version);
        assert_eq!(frame.timestamp.as_deref(), Some("100"));
        assert!(frame.message_type.is_none());
        assert!(frame.message.is_none());

        let shifted = OctopylogFrame::classify("100 200", &PytestembVersion::new(2, 2));
        assert!(shifted.timestamp.is_none());
        assert!(shifted.message_type.is_none());
        assert!(shifted.message.is_none());
    }
}
