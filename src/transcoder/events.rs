//! Vendor event model.
//!
//! Every SSE frame of the assistant stream carries one [`VendorEvent`]: a
//! cumulative snapshot of the current part of the turn. Decoding is lenient
//! where the vendor is known to be sloppy (missing or null fields) and value
//! types this relay does not understand decode to [`ContentValue::Unknown`].

use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;

/// Deserialize a field, falling back to its default when the shape is unexpected
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

/// Status shared by events, parts and content values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Init,
    Processing,
    Finish,
    Intervene,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VendorEvent {
    #[serde(default, deserialize_with = "lenient")]
    pub conversation_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Status,
    #[serde(default, deserialize_with = "lenient")]
    pub parts: Vec<Part>,
    #[serde(default, deserialize_with = "lenient")]
    pub last_error: Option<LastError>,
}

impl VendorEvent {
    /// `finish` and `intervene` end the turn; their parts are not replayed
    pub fn ends_turn(&self) -> bool {
        matches!(self.status, Status::Finish | Status::Intervene)
    }

    /// Moderation notice carried by an `intervene` event
    pub fn intervene_text(&self) -> Option<&str> {
        self.last_error
            .as_ref()
            .and_then(|e| e.intervene_text.as_deref())
            .filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LastError {
    #[serde(default)]
    pub intervene_text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Part {
    #[serde(default, deserialize_with = "lenient")]
    pub status: Status,
    /// Non-array content is treated as empty
    #[serde(default, deserialize_with = "lenient")]
    pub content: Vec<ContentValue>,
    #[serde(default, deserialize_with = "lenient")]
    pub meta_data: Option<QuoteMeta>,
}

/// Search metadata attached to a `quote_result`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuoteMeta {
    #[serde(default, deserialize_with = "lenient")]
    pub metadata_list: Vec<QuoteSource>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuoteSource {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageItem {
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Content value of a part
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ContentValue {
    Known(KnownValue),
    /// Unrecognized or malformed value, ignored
    Unknown(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnownValue {
    Text {
        #[serde(default)]
        status: Option<Status>,
        #[serde(default)]
        text: String,
    },
    Think {
        #[serde(default)]
        status: Option<Status>,
        #[serde(default)]
        think: String,
    },
    QuoteResult {
        #[serde(default)]
        status: Option<Status>,
        #[serde(default, deserialize_with = "lenient")]
        meta_data: Option<QuoteMeta>,
    },
    Image {
        #[serde(default)]
        status: Option<Status>,
        #[serde(default, deserialize_with = "lenient")]
        image: Vec<ImageItem>,
    },
    Code {
        #[serde(default)]
        status: Option<Status>,
        #[serde(default)]
        code: String,
    },
    ExecutionOutput {
        #[serde(default)]
        status: Option<Status>,
        #[serde(default)]
        content: String,
    },
}

impl KnownValue {
    pub fn status(&self) -> Option<Status> {
        match self {
            KnownValue::Text { status, .. }
            | KnownValue::Think { status, .. }
            | KnownValue::QuoteResult { status, .. }
            | KnownValue::Image { status, .. }
            | KnownValue::Code { status, .. }
            | KnownValue::ExecutionOutput { status, .. } => *status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_values() {
        let event: VendorEvent = serde_json::from_str(
            r#"{
                "conversation_id": "c1",
                "status": "processing",
                "parts": [{
                    "status": "init",
                    "content": [
                        {"type": "text", "status": "init", "text": "Hel"},
                        {"type": "code", "code": "print(1)"},
                        {"type": "image", "image": [{"image_url": "https://x/1.png"}]},
                        {"type": "execution_output", "content": "1"}
                    ]
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(event.conversation_id.as_deref(), Some("c1"));
        assert_eq!(event.status, Status::Processing);
        let content = &event.parts[0].content;
        assert!(matches!(
            &content[0],
            ContentValue::Known(KnownValue::Text { status: Some(Status::Init), text }) if text == "Hel"
        ));
        assert!(matches!(&content[1], ContentValue::Known(KnownValue::Code { status: None, .. })));
        assert!(matches!(&content[2], ContentValue::Known(KnownValue::Image { image, .. }) if image.len() == 1));
        assert!(matches!(&content[3], ContentValue::Known(KnownValue::ExecutionOutput { .. })));
    }

    #[test]
    fn test_unknown_values_and_statuses_are_tolerated() {
        let event: VendorEvent = serde_json::from_str(
            r#"{
                "status": "paused",
                "parts": [
                    {"status": null, "content": "not a list"},
                    {"status": "finish", "content": [{"type": "browser_result", "x": 1}, {"type": "text", "text": null}]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(event.status, Status::Other);
        assert!(event.conversation_id.is_none());
        assert_eq!(event.parts[0].status, Status::Other);
        assert!(event.parts[0].content.is_empty());
        assert!(event.parts[1].content.iter().all(|v| matches!(v, ContentValue::Unknown(_))));
    }

    #[test]
    fn test_quote_metadata_and_intervene() {
        let event: VendorEvent = serde_json::from_str(
            r#"{
                "status": "intervene",
                "last_error": {"intervene_text": "blocked"},
                "parts": [{
                    "status": "finish",
                    "meta_data": {"metadata_list": [{"title": "Doc A", "url": "http://x"}]},
                    "content": [{"type": "quote_result", "status": "finish"}]
                }]
            }"#,
        )
        .unwrap();

        assert!(event.ends_turn());
        assert_eq!(event.intervene_text(), Some("blocked"));
        let meta = event.parts[0].meta_data.as_ref().unwrap();
        assert_eq!(meta.metadata_list[0].title.as_deref(), Some("Doc A"));
    }
}
