//! Segment-merging state machine shared by [`collect`](super::collect) and
//! [`RelayStream`](super::RelayStream).
//!
//! Every vendor event is a cumulative snapshot of the part being generated.
//! The state tracks how much of the current cumulative segment has already
//! been emitted and turns each snapshot into the newly visible text. All
//! lengths are counted in chars, never bytes.

use super::citation::CitationFilter;
use super::events::{ContentValue, ImageItem, KnownValue, Part, QuoteMeta, Status, VendorEvent};
use crate::router::ModelProfile;
use std::collections::HashSet;

const THINK_OPEN: &str = "<think>\n";
const THINK_CLOSE: &str = "</think>\n\n";
const CODE_OPEN: &str = "```python\n";
const CODE_CLOSE: &str = "\n```\n";
const REFERENCES_HEADER: &str = "\n\n搜索结果来自：\n";

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEnd {
    Finished,
    /// Content moderation stopped the turn
    Intervened { notice: Option<String> },
}

/// Output of one step
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Emission {
    /// Newly visible text, citation markers already removed
    pub delta: String,
    pub end: Option<TurnEnd>,
}

/// Kind of the cumulative segment currently being streamed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Text,
    Think,
}

#[derive(Debug, Default)]
pub struct TranscoderState {
    profile: ModelProfile,
    conversation_id: Option<String>,
    /// Chars emitted so far, before citation filtering
    emitted: usize,
    /// Value of `emitted` where the current cumulative segment starts
    text_offset: usize,
    segment: Option<Segment>,
    /// Length of the last finished cumulative segment, 0 once separated
    committed_len: usize,
    last_char: Option<char>,
    inside_thinking: bool,
    thinking_closed: bool,
    inside_tool_gap: bool,
    inside_code: bool,
    code_buffer: String,
    last_code: String,
    last_execution_output: Option<String>,
    references: Vec<String>,
    seen_references: HashSet<String>,
    seen_images: HashSet<String>,
    filter: CitationFilter,
    finalized: bool,
}

impl TranscoderState {
    pub fn new(profile: ModelProfile) -> Self {
        Self {
            profile,
            ..Default::default()
        }
    }

    /// Latest conversation id reported by the vendor
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Apply one event, returning the text it adds
    pub fn handle_event(&mut self, event: &VendorEvent) -> Emission {
        if let Some(id) = event.conversation_id.as_deref().filter(|id| !id.is_empty()) {
            self.conversation_id = Some(id.to_string());
        }

        if event.ends_turn() {
            let end = match event.status {
                Status::Intervene => TurnEnd::Intervened {
                    notice: event.intervene_text().map(|text| text.to_string()),
                },
                _ => TurnEnd::Finished,
            };
            return Emission {
                delta: String::new(),
                end: Some(end),
            };
        }

        let mut raw = String::new();
        for part in &event.parts {
            for value in &part.content {
                if let ContentValue::Known(value) = value {
                    self.handle_value(part, value, &mut raw);
                }
            }
        }

        Emission {
            delta: self.filter.push(&raw),
            end: None,
        }
    }

    /// Close whatever is still open and release held back text.
    /// Returns an empty string when called again.
    pub fn finalize(&mut self) -> String {
        if self.finalized {
            return String::new();
        }
        self.finalized = true;

        let mut raw = String::new();
        if self.inside_code {
            self.commit(&mut raw, CODE_CLOSE);
            self.inside_code = false;
        }
        self.close_thinking(&mut raw);
        if !self.references.is_empty() {
            let section = format!("{}{}", REFERENCES_HEADER, self.references.join("\n"));
            self.commit(&mut raw, &section);
        }

        let mut tail = self.filter.push(&raw);
        tail.push_str(&self.filter.flush());
        tail
    }

    fn handle_value(&mut self, part: &Part, value: &KnownValue, out: &mut String) {
        let own_status = value.status();
        let status = own_status.unwrap_or(part.status);
        // Tool results may carry the finish flag on either level
        let finished = own_status == Some(Status::Finish) || part.status == Status::Finish;

        match value {
            KnownValue::Text { text, .. } => {
                self.open_segment(status, out);
                self.close_thinking(out);
                self.close_tool_gap(out);
                self.enter_segment(Segment::Text);
                self.emit_cumulative(text, out);
                // Reasoning only ever precedes the answer
                if !text.is_empty() {
                    self.thinking_closed = true;
                }
                if status == Status::Finish {
                    self.committed_len = text.chars().count();
                }
            }
            KnownValue::Think { think, .. } => {
                if !self.profile.reasoning || self.profile.silent || self.thinking_closed {
                    return;
                }
                self.open_segment(status, out);
                if !self.inside_thinking {
                    self.commit(out, THINK_OPEN);
                    self.inside_thinking = true;
                }
                self.close_tool_gap(out);
                self.enter_segment(Segment::Think);
                self.emit_cumulative(think, out);
                if status == Status::Finish {
                    self.committed_len = think.chars().count();
                }
            }
            KnownValue::QuoteResult { meta_data, .. } => {
                if !finished || self.profile.silent {
                    return;
                }
                let meta = meta_data.as_ref().or(part.meta_data.as_ref());
                self.handle_quotes(meta, out);
            }
            KnownValue::Image { image, .. } => {
                if finished {
                    self.handle_images(image, out);
                }
            }
            KnownValue::Code { code, .. } => {
                self.open_segment(status, out);
                self.handle_code(code, finished, out);
            }
            KnownValue::ExecutionOutput { content, .. } => {
                if !finished || self.last_execution_output.as_deref() == Some(content.as_str()) {
                    return;
                }
                self.last_execution_output = Some(content.clone());
                let output = content.strip_prefix('\n').unwrap_or(content);
                self.commit(out, &format!("{}\n", output));
                self.segment = None;
            }
        }
    }

    fn handle_quotes(&mut self, meta: Option<&QuoteMeta>, out: &mut String) {
        let Some(meta) = meta else {
            return;
        };

        let mut progress = String::new();
        for source in &meta.metadata_list {
            let title = source.title.as_deref().unwrap_or_default();
            let url = source.url.as_deref().unwrap_or_default();
            if title.is_empty() && url.is_empty() {
                continue;
            }
            let reference = format!("{} - {}", title, url);
            if self.seen_references.insert(reference.clone()) {
                self.references.push(reference);
                progress.push_str(&format!("检索 {}({}) ...\n", title, url));
            }
        }

        if !progress.is_empty() {
            self.commit(out, &progress);
            self.inside_tool_gap = true;
            self.segment = None;
        }
    }

    fn handle_images(&mut self, images: &[ImageItem], out: &mut String) {
        let mut rendered = String::new();
        for url in images.iter().filter_map(|item| item.image_url.as_deref()) {
            if !is_http_url(url) || !self.seen_images.insert(url.to_string()) {
                continue;
            }
            rendered.push_str(&format!("![图像]({})", url));
        }

        if !rendered.is_empty() {
            rendered.push('\n');
            self.commit(out, &rendered);
            self.inside_tool_gap = true;
            self.segment = None;
        }
    }

    fn handle_code(&mut self, code: &str, finished: bool, out: &mut String) {
        self.segment = None;

        if !finished {
            if !self.inside_code {
                self.commit(out, CODE_OPEN);
                self.inside_code = true;
            }
            let streamed = self.code_buffer.chars().count();
            let delta: String = code.chars().skip(streamed).collect();
            if !delta.is_empty() {
                self.commit(out, &delta);
                self.code_buffer.push_str(&delta);
            }
            return;
        }

        if self.inside_code {
            let streamed = self.code_buffer.chars().count();
            let rest: String = code.chars().skip(streamed).collect();
            self.commit(out, &format!("{}{}", rest, CODE_CLOSE));
            self.inside_code = false;
            self.code_buffer.clear();
            self.last_code = code.to_string();
        } else if !code.is_empty() && code != self.last_code {
            // Finished block that never streamed
            self.commit(out, &format!("{}{}{}", CODE_OPEN, code, CODE_CLOSE));
            self.last_code = code.to_string();
        }
    }

    /// A value in `init` after a finished segment starts a new line
    fn open_segment(&mut self, status: Status, out: &mut String) {
        if status == Status::Init && self.committed_len > 0 {
            self.committed_len = 0;
            self.commit(out, "\n");
            self.segment = None;
        }
    }

    fn enter_segment(&mut self, segment: Segment) {
        if self.segment != Some(segment) {
            self.segment = Some(segment);
            self.text_offset = self.emitted;
        }
    }

    fn close_thinking(&mut self, out: &mut String) {
        if !self.inside_thinking {
            return;
        }
        if self.last_char != Some('\n') {
            self.commit(out, "\n");
        }
        self.commit(out, THINK_CLOSE);
        self.inside_thinking = false;
        self.thinking_closed = true;
        self.segment = None;
        self.committed_len = 0;
    }

    fn close_tool_gap(&mut self, out: &mut String) {
        if self.inside_tool_gap {
            self.commit(out, "\n");
            self.inside_tool_gap = false;
        }
    }

    /// Emit the part of a cumulative value not streamed yet
    fn emit_cumulative(&mut self, cumulative: &str, out: &mut String) {
        let streamed = self.emitted - self.text_offset;
        let delta: String = cumulative.chars().skip(streamed).collect();
        if delta.is_empty() {
            return;
        }
        self.emitted += delta.chars().count();
        self.last_char = delta.chars().last();
        out.push_str(&delta);
    }

    /// Emit a piece that is not part of the cumulative segment.
    /// The segment start moves along so the streamed count stays exact.
    fn commit(&mut self, out: &mut String, piece: &str) {
        let len = piece.chars().count();
        if len == 0 {
            return;
        }
        self.emitted += len;
        self.text_offset += len;
        self.last_char = piece.chars().last();
        out.push_str(piece);
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
