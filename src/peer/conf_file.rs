//! Managed peer blocks in the interface config file
//!
//! The interface config file is owned by the administrator. The daemon only
//! touches regions delimited by marker comments:
//!
//! ```text
//! # [WG-DASHBOARD BEGIN name="alice" pub="<public key>"]
//! [Peer]
//! PublicKey = <public key>
//! PresharedKey = <pre-shared key>
//! AllowedIPs = 10.0.70.2/32
//! # [WG-DASHBOARD END]
//! ```
//!
//! Blocks are found by parsing marker lines and their `key="value"`
//! attributes. A BEGIN line without a matching END line is left alone.
//! Everything outside managed blocks is preserved as-is, apart from the
//! blank lines directly around a removed block.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::storage::write_atomic;
use crate::error::ConfFileError;

/// One managed `[Peer]` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlock {
    /// Peer name, recorded in the BEGIN marker
    pub name: String,
    /// Peer public key
    pub public_key: String,
    /// Pre-shared key
    pub preshared_key: String,
    /// `AllowedIPs` value
    pub allowed_addresses: String,
}

impl ConfigBlock {
    /// Render the block, ending with a newline
    pub fn render(&self, marker: &str) -> String {
        format!(
            "{}\n[Peer]\nPublicKey = {}\nPresharedKey = {}\nAllowedIPs = {}\n{}\n",
            begin_line(marker, &self.name, &self.public_key),
            self.public_key,
            self.preshared_key,
            self.allowed_addresses,
            end_line(marker),
        )
    }
}

/// A block located in a file, with its line span
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBlock {
    /// Block contents
    pub block: ConfigBlock,
    /// Index of the BEGIN line
    pub begin: usize,
    /// Index of the END line
    pub end: usize,
    /// `pub` attribute of the BEGIN marker
    pub marker_public_key: Option<String>,
}

fn begin_line(marker: &str, name: &str, public_key: &str) -> String {
    format!("# [{marker} BEGIN name=\"{name}\" pub=\"{public_key}\"]")
}

fn end_line(marker: &str) -> String {
    format!("# [{marker} END]")
}

/// Attributes of a BEGIN marker line, or `None` if the line is not one
fn parse_begin(line: &str, marker: &str) -> Option<Vec<(String, String)>> {
    let rest = line.trim().strip_prefix("# [")?;
    let rest = rest.strip_prefix(marker)?;
    let rest = rest.strip_prefix(" BEGIN")?;
    let body = rest.strip_suffix(']')?;
    parse_attributes(body)
}

fn is_end(line: &str, marker: &str) -> bool {
    line.trim() == end_line(marker)
}

/// Parse ` key="value" key2="value2"`
fn parse_attributes(mut input: &str) -> Option<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    loop {
        input = input.trim_start();
        if input.is_empty() {
            return Some(attrs);
        }
        let (key, rest) = input.split_once('=')?;
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        let rest = rest.strip_prefix('"')?;
        let (value, rest) = rest.split_once('"')?;
        attrs.push((key.to_string(), value.to_string()));
        input = rest;
    }
}

fn attribute<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Parse every terminated managed block in `lines`
fn parse_lines(lines: &[&str], marker: &str) -> Vec<ParsedBlock> {
    let mut blocks = Vec::new();
    let mut open: Option<(usize, Vec<(String, String)>)> = None;

    for (idx, line) in lines.iter().enumerate() {
        if let Some(attrs) = parse_begin(line, marker) {
            if let Some((prev, _)) = &open {
                debug!(line = prev + 1, "unterminated managed block ignored");
            }
            open = Some((idx, attrs));
            continue;
        }

        if is_end(line, marker) {
            if let Some((begin, attrs)) = open.take() {
                blocks.push(ParsedBlock {
                    block: block_from_lines(&attrs, &lines[begin + 1..idx]),
                    begin,
                    end: idx,
                    marker_public_key: attribute(&attrs, "pub").map(str::to_string),
                });
            }
        }
    }

    blocks
}

fn block_from_lines(attrs: &[(String, String)], body: &[&str]) -> ConfigBlock {
    let mut block = ConfigBlock {
        name: attribute(attrs, "name").unwrap_or_default().to_string(),
        public_key: attribute(attrs, "pub").unwrap_or_default().to_string(),
        preshared_key: String::new(),
        allowed_addresses: String::new(),
    };

    for line in body {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "PublicKey" if block.public_key.is_empty() => block.public_key = value,
            "PresharedKey" => block.preshared_key = value,
            "AllowedIPs" => block.allowed_addresses = value,
            _ => {}
        }
    }

    block
}

/// Parse every managed block in `text`
pub fn parse_blocks(text: &str, marker: &str) -> Vec<ConfigBlock> {
    let text = text.replace("\r\n", "\n");
    let lines: Vec<&str> = text.lines().collect();
    parse_lines(&lines, marker)
        .into_iter()
        .map(|parsed| parsed.block)
        .collect()
}

/// Remove the blocks whose BEGIN marker carries `pub="<public_key>"`
///
/// Returns `None` when no such block exists. Blank lines touching a removed
/// block are dropped and a single blank line is kept between the content
/// that surrounded it. Line endings are normalized to `\n` and non-empty
/// output ends with a newline.
pub fn remove_block_text(text: &str, marker: &str, public_key: &str) -> Option<String> {
    let text = text.replace("\r\n", "\n");
    let mut lines: Vec<&str> = text.lines().collect();

    let spans: Vec<(usize, usize)> = parse_lines(&lines, marker)
        .into_iter()
        .filter(|parsed| parsed.marker_public_key.as_deref() == Some(public_key))
        .map(|parsed| (parsed.begin, parsed.end))
        .collect();

    if spans.is_empty() {
        return None;
    }

    // Back to front so earlier spans keep their indices
    for (begin, end) in spans.into_iter().rev() {
        let mut start = begin;
        while start > 0 && lines[start - 1].trim().is_empty() {
            start -= 1;
        }
        let mut stop = end + 1;
        while stop < lines.len() && lines[stop].trim().is_empty() {
            stop += 1;
        }

        let has_before = start > 0;
        let has_after = stop < lines.len();
        let replacement: &[&str] = if has_before && has_after { &[""] } else { &[] };
        lines.splice(start..stop, replacement.iter().copied());
    }

    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    Some(out)
}

/// Handle to the interface config file
#[derive(Debug, Clone)]
pub struct ConfFile {
    path: PathBuf,
    marker: String,
}

impl ConfFile {
    /// Create a handle for `path` using `marker` in block delimiters
    pub fn new(path: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            marker: marker.into(),
        }
    }

    /// Path of the config file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Marker tag used in block delimiters
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Append a block at the end of the file, preceded by a newline
    ///
    /// # Errors
    ///
    /// Returns `ConfFileError::Write` if the file cannot be opened or written.
    pub fn append_block(&self, block: &ConfigBlock) -> Result<(), ConfFileError> {
        let text = format!("\n{}", block.render(&self.marker));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ConfFileError::write(&self.path, e.to_string()))?;
        file.write_all(text.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| ConfFileError::write(&self.path, e.to_string()))?;

        debug!(path = %self.path.display(), peer = %block.public_key, "config block appended");
        Ok(())
    }

    /// Remove the block for `public_key`
    ///
    /// Returns `Ok(false)` when there is no such block, including when the
    /// file itself does not exist.
    ///
    /// # Errors
    ///
    /// Returns `ConfFileError` if the file cannot be read or rewritten.
    pub fn remove_block(&self, public_key: &str) -> Result<bool, ConfFileError> {
        let Some(text) = self.read()? else {
            warn!(path = %self.path.display(), "config file missing, nothing to remove");
            return Ok(false);
        };

        match remove_block_text(&text, &self.marker, public_key) {
            Some(updated) => {
                write_atomic(&self.path, updated.as_bytes(), None)
                    .map_err(|e| ConfFileError::write(&self.path, e.to_string()))?;
                debug!(path = %self.path.display(), peer = %public_key, "config block removed");
                Ok(true)
            }
            None => {
                warn!(path = %self.path.display(), peer = %public_key, "no config block for peer");
                Ok(false)
            }
        }
    }

    /// All managed blocks in the file; a missing file has none
    ///
    /// # Errors
    ///
    /// Returns `ConfFileError::Read` if the file exists but cannot be read.
    pub fn blocks(&self) -> Result<Vec<ConfigBlock>, ConfFileError> {
        Ok(self
            .read()?
            .map(|text| parse_blocks(&text, &self.marker))
            .unwrap_or_default())
    }

    fn read(&self) -> Result<Option<String>, ConfFileError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfFileError::read(&self.path, e.to_string())),
        }
    }
}
