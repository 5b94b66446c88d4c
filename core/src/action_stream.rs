//! Newline-delimited JSON decoding for streamed sequence responses.
//!
//! Each line of a sequence response is a JSON object `{"action": {...}}`.
//! Chunks arrive at arbitrary byte boundaries, so the trailing partial line
//! is buffered until its terminator arrives. Lines without an `action` key
//! are skipped; lines that fail to parse are surfaced as
//! [`SequenceRecord::Malformed`] so callers can log and count them instead
//! of failing the behavior.

use crate::action::Action;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One decoded line of a sequence stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceRecord {
    Action(Action),
    Malformed(MalformedLine),
}

/// A line that could not be decoded into an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalformedLine {
    pub line: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Lines longer than this are reported as malformed and dropped
    pub max_line_length: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_line_length: 1024 * 1024, // 1 MB
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderStatistics {
    pub lines: u64,
    pub actions: u64,
    pub skipped: u64,
    pub malformed: u64,
}

#[derive(Deserialize)]
struct ActionLine {
    #[serde(default)]
    action: Option<serde_json::Value>,
}

/// Incremental NDJSON decoder for action records.
#[derive(Debug, Default)]
pub struct ActionLineDecoder {
    config: DecoderConfig,
    buffer: Vec<u8>,
    /// Dropping the rest of an overlong line until its terminator
    discarding: bool,
    stats: DecoderStatistics,
}

impl ActionLineDecoder {
    pub fn new() -> Self {
        Self::with_config(DecoderConfig::default())
    }

    pub fn with_config(config: DecoderConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            discarding: false,
            stats: DecoderStatistics::default(),
        }
    }

    pub fn statistics(&self) -> DecoderStatistics {
        self.stats
    }

    /// Feed a chunk and return every record completed by it.
    ///
    /// At most `max_line_length` bytes are ever buffered. A line that grows
    /// past the limit is reported once and the rest of it is dropped up to
    /// the next newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SequenceRecord> {
        let mut records = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            let Some(pos) = rest.iter().position(|b| *b == b'\n') else {
                if !self.discarding {
                    if self.buffer.len() + rest.len() > self.config.max_line_length {
                        records.push(self.overlong(rest));
                        self.discarding = true;
                    } else {
                        self.buffer.extend_from_slice(rest);
                    }
                }
                break;
            };

            let line = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if self.buffer.len() + line.len() > self.config.max_line_length {
                records.push(self.overlong(line));
                continue;
            }

            self.buffer.extend_from_slice(line);
            let raw = std::mem::take(&mut self.buffer);
            if let Some(record) = self.decode_line(&raw) {
                records.push(record);
            }
        }
        records
    }

    /// Flush the buffered tail once the stream has ended.
    pub fn finish(&mut self) -> Option<SequenceRecord> {
        self.discarding = false;
        if self.buffer.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.buffer);
        self.decode_line(&tail)
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<SequenceRecord> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();
        if line.is_empty() {
            return None;
        }
        self.stats.lines += 1;

        let parsed: ActionLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => return Some(self.malformed(line.to_string(), e.to_string())),
        };

        let Some(value) = parsed.action else {
            self.stats.skipped += 1;
            return None;
        };

        match serde_json::from_value::<Action>(value) {
            Ok(action) => {
                self.stats.actions += 1;
                Some(SequenceRecord::Action(action))
            }
            Err(e) => Some(self.malformed(line.to_string(), e.to_string())),
        }
    }

    /// Report the line being assembled from the buffer plus `more` as too
    /// long and release the buffer.
    fn overlong(&mut self, more: &[u8]) -> SequenceRecord {
        let mut head = std::mem::take(&mut self.buffer);
        let needed = PREVIEW_BYTES.saturating_sub(head.len());
        head.extend_from_slice(&more[..needed.min(more.len())]);
        head.truncate(PREVIEW_BYTES);

        self.stats.lines += 1;
        let line = format!("{}...", String::from_utf8_lossy(&head));
        let reason = format!("line exceeds {} bytes", self.config.max_line_length);
        self.malformed(line, reason)
    }

    fn malformed(&mut self, line: String, reason: String) -> SequenceRecord {
        self.stats.malformed += 1;
        warn!("Skipping malformed sequence line ({}): {}", reason, line);
        SequenceRecord::Malformed(MalformedLine { line, reason })
    }
}

const PREVIEW_BYTES: usize = 64;
