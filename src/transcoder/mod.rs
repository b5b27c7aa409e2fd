//! Vendor stream transcoding.
//!
//! [`collect`] folds a vendor stream into one answer, [`RelayStream`] turns it
//! into chat completion chunk frames. Both drive the same
//! [`TranscoderState`], so the relayed deltas always concatenate to the
//! collected content.

pub mod citation;
pub mod collect;
pub mod events;
pub mod images;
pub mod relay;
pub mod state;

pub use collect::{collect, FinalAnswer};
pub use events::VendorEvent;
pub use images::collect_images;
pub use relay::{RelayOutcome, RelayStream};
pub use state::{Emission, TranscoderState, TurnEnd};

use crate::providers::streaming::SseEvent;
use crate::providers::ProviderError;

/// Decode the JSON payload of one SSE event.
/// Keep-alive frames without data yield `None`.
pub fn parse_event(event: &SseEvent) -> Result<Option<VendorEvent>, ProviderError> {
    let data = event.data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(data)
        .map(Some)
        .map_err(|e| ProviderError::MalformedStream(format!("{}: {}", e, truncate(data, 200))))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
