use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;

fn default_model() -> String {
    "glm-4".to_string()
}

/// OpenAI chat completion request format
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    #[serde(default = "default_model")]
    pub model: String,
    /// Vendor conversation to resume; ignored unless it looks like a real id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// Message in the conversation
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl ChatMessage {
    pub fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(MessageContent::Text(text.into())),
        }
    }

    /// Text pieces of this message in order
    pub fn texts(&self) -> Vec<&str> {
        match &self.content {
            None => Vec::new(),
            Some(MessageContent::Text(text)) => vec![text.as_str()],
            Some(MessageContent::Parts(parts)) => parts.iter().filter_map(|p| p.as_text()).collect(),
        }
    }

    /// URLs of attached files and images
    pub fn attachment_urls(&self) -> Vec<&str> {
        match &self.content {
            Some(MessageContent::Parts(parts)) => {
                parts.iter().filter_map(|p| p.attachment_url()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn has_attachment(&self) -> bool {
        !self.attachment_urls().is_empty()
    }
}

/// Message content can be a string or an array of content parts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// Content part for multimodal messages.
///
/// Parts this relay does not understand are kept as raw JSON and ignored,
/// so clients sending newer part types are not rejected.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ContentPart {
    Known(KnownContentPart),
    Unknown(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnownContentPart {
    Text { text: String },
    File { file_url: UrlRef },
    ImageUrl { image_url: UrlRef },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UrlRef {
    pub url: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Known(KnownContentPart::Text { text: text.into() })
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        ContentPart::Known(KnownContentPart::ImageUrl {
            image_url: UrlRef { url: url.into() },
        })
    }

    pub fn file(url: impl Into<String>) -> Self {
        ContentPart::Known(KnownContentPart::File {
            file_url: UrlRef { url: url.into() },
        })
    }

    /// Get text content if this is a text part
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Known(KnownContentPart::Text { text }) => Some(text),
            _ => None,
        }
    }

    /// Get the referenced URL if this is a file or image part
    pub fn attachment_url(&self) -> Option<&str> {
        match self {
            ContentPart::Known(KnownContentPart::File { file_url }) => Some(&file_url.url),
            ContentPart::Known(KnownContentPart::ImageUrl { image_url }) => Some(&image_url.url),
            _ => None,
        }
    }
}

/// Non-streaming chat completion response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    pub created: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

/// One SSE frame of a streaming completion
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub model: String,
    pub object: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub created: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    /// Serialized as `null` until the last frame
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// cl100k is close enough to the vendor tokenizer for accounting purposes
static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| tiktoken_rs::cl100k_base().ok());

/// Count tokens of a text, falling back to a chars/4 estimate
pub fn count_tokens(text: &str) -> u32 {
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => (text.chars().count() as u32).div_ceil(4),
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn count(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = count_tokens(prompt);
        let completion_tokens = count_tokens(completion);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// `GET /v1/models` response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

impl ModelList {
    pub fn from_ids(ids: &[String]) -> Self {
        Self {
            object: "list".to_string(),
            data: ids
                .iter()
                .map(|id| ModelInfo {
                    id: id.clone(),
                    object: "model".to_string(),
                    owned_by: "glm-relay".to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageGenerationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageGenerationResponse {
    pub created: i64,
    pub data: Vec<ImageData>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageData {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VideoGenerationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_style: Option<VideoStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_atmosphere: Option<EmotionalAtmosphere>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_mode: Option<MirrorMode>,
    /// `<key>-<id>` of a vendor soundtrack to composite onto the video
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum VideoStyle {
    #[serde(rename = "卡通3D")]
    Cartoon3d,
    #[serde(rename = "黑白老照片")]
    BlackAndWhite,
    #[serde(rename = "油画")]
    OilPainting,
    #[serde(rename = "电影感")]
    Cinematic,
}

impl VideoStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStyle::Cartoon3d => "卡通3D",
            VideoStyle::BlackAndWhite => "黑白老照片",
            VideoStyle::OilPainting => "油画",
            VideoStyle::Cinematic => "电影感",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum EmotionalAtmosphere {
    #[serde(rename = "温馨和谐")]
    Warm,
    #[serde(rename = "生动活泼")]
    Lively,
    #[serde(rename = "紧张刺激")]
    Tense,
    #[serde(rename = "凄凉寂寞")]
    Desolate,
}

impl EmotionalAtmosphere {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionalAtmosphere::Warm => "温馨和谐",
            EmotionalAtmosphere::Lively => "生动活泼",
            EmotionalAtmosphere::Tense => "紧张刺激",
            EmotionalAtmosphere::Desolate => "凄凉寂寞",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum MirrorMode {
    #[serde(rename = "水平")]
    Horizontal,
    #[serde(rename = "垂直")]
    Vertical,
    #[serde(rename = "推近")]
    ZoomIn,
    #[serde(rename = "拉远")]
    ZoomOut,
}

impl MirrorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorMode::Horizontal => "水平",
            MirrorMode::Vertical => "垂直",
            MirrorMode::ZoomIn => "推近",
            MirrorMode::ZoomOut => "拉远",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VideoResult {
    pub conversation_id: String,
    pub cover_url: Option<String>,
    pub video_url: Option<String>,
    pub video_duration: serde_json::Value,
    pub resolution: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VideoGenerationResponse {
    pub created: i64,
    pub data: Vec<VideoResult>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenCheckRequest {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenCheckResponse {
    pub live: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_content_variants() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "assistant", "content": null},
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "https://x/a.png"}},
                    {"type": "file", "file_url": {"url": "https://x/b.pdf"}},
                    {"type": "input_audio", "input_audio": {"data": "..."}}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(request.model, "glm-4");
        assert!(!request.is_stream());
        assert_eq!(request.messages[0].texts(), vec!["be brief"]);
        assert!(request.messages[1].texts().is_empty());

        let last = &request.messages[2];
        assert_eq!(last.texts(), vec!["what is this"]);
        assert_eq!(last.attachment_urls(), vec!["https://x/a.png", "https://x/b.pdf"]);
        assert!(last.has_attachment());
        assert!(matches!(
            &last.content,
            Some(MessageContent::Parts(parts)) if matches!(parts[3], ContentPart::Unknown(_))
        ));
    }

    #[test]
    fn test_chunk_serializes_null_finish_reason() {
        let chunk = ChatCompletionChunk {
            id: String::new(),
            model: "glm-4".to_string(),
            object: "chat.completion.chunk".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: Some("assistant".to_string()),
                    content: Some(String::new()),
                },
                finish_reason: None,
            }],
            usage: None,
            created: 1,
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert!(value["choices"][0]["finish_reason"].is_null());
        assert!(value.get("usage").is_none());
        assert_eq!(value["choices"][0]["delta"]["role"], "assistant");
    }

    #[test]
    fn test_video_enums_reject_unknown_values() {
        let ok: VideoGenerationRequest = serde_json::from_value(json!({
            "prompt": "a cat",
            "video_style": "油画",
            "mirror_mode": "推近"
        }))
        .unwrap();
        assert_eq!(ok.video_style, Some(VideoStyle::OilPainting));
        assert_eq!(ok.mirror_mode.map(|m| m.as_str()), Some("推近"));

        let bad = serde_json::from_value::<VideoGenerationRequest>(json!({
            "prompt": "a cat",
            "video_style": "水彩"
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_usage_counts() {
        let usage = Usage::count("hello world", "");
        assert!(usage.prompt_tokens > 0);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.total_tokens, usage.prompt_tokens);
    }
}
