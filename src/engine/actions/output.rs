use crate::engine::log_tailer::{truncate_str, TRUNCATION_MARKER};
use crate::model::OutputLimits;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
    System,
}

impl OutputStream {
    pub fn tag(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
            OutputStream::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    /// `[stream] text`, the form a plain-text renderer shows.
    pub fn render(&self) -> String {
        format!("[{}] {}", self.stream.tag(), self.text)
    }

    // rendered bytes plus the newline between lines
    fn cost(&self) -> usize {
        self.stream.tag().len() + 3 + self.text.len() + 1
    }
}

fn cut_at_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Sliding window over a run's merged output, bounded by both line count and
/// bytes. The newest line is never evicted; a single line larger than the
/// byte bound is cut to fit. Only a bound smaller than the bare `[tag] `
/// prefix can be exceeded, by that one line.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    bytes: usize,
    limits: OutputLimits,
    total_lines: u64,
    evicted_lines: u64,
}

impl OutputBuffer {
    pub fn new(limits: OutputLimits) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limits: limits.clamped(),
            total_lines: 0,
            evicted_lines: 0,
        }
    }

    pub fn push(&mut self, stream: OutputStream, text: impl Into<String>) {
        let text: String = text.into();
        let mut line = OutputLine {
            stream,
            text: text.trim_end_matches(['\r', '\n']).to_string(),
        };
        if line.cost() > self.limits.max_bytes {
            let overhead = OutputLine {
                stream,
                text: String::new(),
            }
            .cost();
            let room = self.limits.max_bytes.saturating_sub(overhead);
            line.text = if room > TRUNCATION_MARKER.len() {
                truncate_str(&line.text, room - TRUNCATION_MARKER.len())
            } else {
                // no space for the marker; keep what fits
                cut_at_boundary(&line.text, room).to_string()
            };
        }
        self.bytes += line.cost();
        self.lines.push_back(line);
        self.total_lines += 1;
        while self.lines.len() > 1
            && (self.lines.len() > self.limits.max_lines || self.bytes > self.limits.max_bytes)
        {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.cost();
                self.evicted_lines += 1;
            }
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &OutputLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    pub fn evicted_lines(&self) -> u64 {
        self.evicted_lines
    }

    pub fn to_vec(&self) -> Vec<OutputLine> {
        self.lines.iter().cloned().collect()
    }

    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(OutputLine::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
