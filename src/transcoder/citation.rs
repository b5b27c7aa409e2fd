use once_cell::sync::Lazy;
use regex::Regex;

/// Footnote markers the vendor leaves in answers, e.g. `【3†source】`
static MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"【\d+†(来源|源|source)】").unwrap());

/// A trailing prefix that could still grow into a marker
static PARTIAL_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^【\d*(?:†(?:来源?|源|s(?:o(?:u(?:r(?:c(?:e)?)?)?)?)?)?)?$").unwrap()
});

/// Strips citation markers from streamed text.
///
/// Text is pushed in arbitrary pieces. A trailing piece that may be the start
/// of a marker is held back until the next push (or [`flush`](Self::flush)),
/// so markers split across events are removed too.
#[derive(Debug, Default)]
pub struct CitationFilter {
    held: String,
}

impl CitationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a piece of text, returning the part that is safe to emit
    pub fn push(&mut self, piece: &str) -> String {
        let mut text = std::mem::take(&mut self.held);
        text.push_str(piece);
        let mut text = strip_markers(text);

        if let Some(start) = text.rfind('【') {
            if PARTIAL_MARKER.is_match(&text[start..]) {
                self.held = text.split_off(start);
            }
        }
        text
    }

    /// Release whatever is still held back
    pub fn flush(&mut self) -> String {
        strip_markers(std::mem::take(&mut self.held))
    }
}

/// Remove every complete marker, including ones formed by a removal
pub fn strip_markers(mut text: String) -> String {
    while MARKER.is_match(&text) {
        text = MARKER.replace_all(&text, "").into_owned();
    }
    text
}
