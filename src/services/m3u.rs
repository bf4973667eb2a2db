//! M3U text codec
//!
//! Shared by playlist ingest, audit summaries and the shard store. A block is
//! a `#EXTINF:` metadata line, an optional `#ESTADO:` state marker and the
//! stream URL line. Section headers and other `#` comments are skipped.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

use crate::models::LivenessState;

pub const HEADER: &str = "#EXTM3U";
pub const EXTINF_PREFIX: &str = "#EXTINF:";
pub const STATE_MARKER: &str = "#ESTADO:";

/// Stream schemes accepted on the URL line
const ALLOWED_SCHEMES: &[&str] = &["http", "https", "rtmp", "rtmps", "rtsp", "udp"];

lazy_static! {
    /// Regex to normalize multiple whitespaces into single space
    static ref MULTI_SPACE_REGEX: Regex = Regex::new(r"\s{2,}").unwrap();
    /// Regex to parse EXTINF attributes (tvg-id="...", group-title="...", etc)
    static ref ATTR_REGEX: Regex = Regex::new(r#"(\w+(?:-\w+)*)="([^"]*)""#).unwrap();
    /// Audit summaries may embed the state inside the metadata line
    static ref AUDIT_STATE_REGEX: Regex = Regex::new(r"\s*#ESTADO_AUDITORIA:(\w+)").unwrap();
}

/// Malformed playlist entries
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: metadata line has no display name")]
    MalformedExtinf { line: usize },
    #[error("line {line}: metadata line is not followed by a stream URL")]
    MissingUrl { line: usize },
    #[error("line {line}: invalid stream URL {url:?}")]
    InvalidUrl { line: usize, url: String },
}

/// Parsed EXTINF line data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtinfData {
    pub attributes: HashMap<String, String>,
    pub title: String,
}

impl ExtinfData {
    /// Non-empty attribute value
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// One complete metadata + URL block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    /// 1-based line of the metadata line
    pub line: usize,
    pub extinf: ExtinfData,
    /// Value of the `#ESTADO:` marker line, if any
    pub state: Option<String>,
    /// Value of an inline `#ESTADO_AUDITORIA:` tag, if any
    pub audit_state: Option<String>,
    pub url: String,
}

impl RawBlock {
    /// Liveness carried by the block (marker line first, then audit tag)
    pub fn liveness(&self) -> LivenessState {
        self.state
            .as_deref()
            .or(self.audit_state.as_deref())
            .map(LivenessState::parse_lenient)
            .unwrap_or_default()
    }
}

/// Normalize text: trim and collapse multiple spaces into single space
pub fn normalize_text(text: &str) -> String {
    let trimmed = text.trim();
    MULTI_SPACE_REGEX.replace_all(trimmed, " ").to_string()
}

/// Index of the first comma outside double quotes
fn title_separator(content: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (idx, c) in content.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}

/// Parse an EXTINF line
/// Format: #EXTINF:duration tvg-id="..." tvg-logo="..." group-title="...",Title
pub fn parse_extinf(line: &str, line_no: usize) -> Result<ExtinfData, ParseError> {
    let content = line
        .strip_prefix(EXTINF_PREFIX)
        .ok_or(ParseError::MalformedExtinf { line: line_no })?;
    let content = AUDIT_STATE_REGEX.replace_all(content, "");

    let comma = title_separator(&content).ok_or(ParseError::MalformedExtinf { line: line_no })?;
    let header = &content[..comma];
    let title = normalize_text(&content[comma + 1..]);
    if title.is_empty() {
        return Err(ParseError::MalformedExtinf { line: line_no });
    }

    let mut attributes = HashMap::new();
    for caps in ATTR_REGEX.captures_iter(header) {
        let key = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let value = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
        attributes.insert(key, value);
    }

    Ok(ExtinfData {
        attributes,
        title,
    })
}

/// Validate a stream URL line, returning it unchanged
pub fn validate_stream_url(raw: &str, line_no: usize) -> Result<String, ParseError> {
    let invalid = || ParseError::InvalidUrl {
        line: line_no,
        url: raw.to_string(),
    };
    let parsed = Url::parse(raw).map_err(|_| invalid())?;
    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return Err(invalid());
    }
    Ok(raw.to_string())
}

struct PendingBlock {
    line: usize,
    extinf: Result<ExtinfData, ParseError>,
    state: Option<String>,
    audit_state: Option<String>,
}

impl PendingBlock {
    fn unfinished(self) -> ParseError {
        match self.extinf {
            Err(e) => e,
            Ok(_) => ParseError::MissingUrl { line: self.line },
        }
    }
}

/// Extract every block from playlist text. Malformed entries are reported
/// individually so callers can count and skip them.
pub fn parse_blocks(text: &str) -> Vec<Result<RawBlock, ParseError>> {
    let mut blocks = Vec::new();
    let mut pending: Option<PendingBlock> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw_line.trim();

        if trimmed.is_empty() {
            continue;
        }

        if trimmed.starts_with(EXTINF_PREFIX) {
            if let Some(previous) = pending.take() {
                blocks.push(Err(previous.unfinished()));
            }
            pending = Some(PendingBlock {
                line: line_no,
                extinf: parse_extinf(trimmed, line_no),
                state: None,
                audit_state: AUDIT_STATE_REGEX
                    .captures(trimmed)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string()),
            });
            continue;
        }

        if let Some(value) = trimmed.strip_prefix(STATE_MARKER) {
            if let Some(block) = pending.as_mut() {
                block.state = Some(value.trim().to_string());
            }
            continue;
        }

        // Header, section titles, #EXTVLCOPT and friends
        if trimmed.starts_with('#') {
            continue;
        }

        // Stray text between metadata and URL
        if !trimmed.contains("://") {
            continue;
        }

        if let Some(block) = pending.take() {
            let line = block.line;
            let state = block.state;
            let audit_state = block.audit_state;
            blocks.push(block.extinf.and_then(|extinf| {
                Ok(RawBlock {
                    line,
                    extinf,
                    state,
                    audit_state,
                    url: validate_stream_url(trimmed, line_no)?,
                })
            }));
        }
    }

    if let Some(block) = pending.take() {
        blocks.push(Err(block.unfinished()));
    }

    blocks
}

fn sanitize(value: &str) -> String {
    normalize_text(&value.replace(['\r', '\n'], " ").replace('"', "'"))
}

/// Render a metadata line; empty attribute values are omitted
pub fn render_extinf(attributes: &[(&str, &str)], title: &str) -> String {
    let mut line = format!("{}-1", EXTINF_PREFIX);
    for (key, value) in attributes {
        if value.trim().is_empty() {
            continue;
        }
        line.push_str(&format!(" {}=\"{}\"", key, sanitize(value)));
    }
    line.push(',');
    line.push_str(&normalize_text(&title.replace(['\r', '\n'], " ")));
    line
}

pub fn render_state(state: LivenessState) -> String {
    format!("{}{}", STATE_MARKER, state)
}

pub fn section_header(title: &str) -> String {
    format!("# ====== {} ======", title)
}
