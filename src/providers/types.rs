//! Request and response bodies of the ChatGLM web endpoints.

use crate::router::ChatMode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Vendor descriptor of an uploaded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReference {
    /// `file_id` for chat uploads, `source_id` for video image uploads
    #[serde(rename = "file_id", alias = "source_id", default)]
    pub id: String,
    #[serde(rename = "file_url", alias = "source_url", default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Mirrors `url` for image attachments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Other vendor fields, sent back verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileReference {
    /// Image references carry a width or a height
    pub fn is_image(&self) -> bool {
        self.width.is_some_and(|w| w > 0) || self.height.is_some_and(|h| h > 0)
    }
}

/// Where an upload goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    /// Chat attachment
    Chat,
    /// Reference image for video generation
    VideoImage,
}

/// File bytes ready for a multipart upload
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Body of the assistant stream endpoint
#[derive(Debug, Clone, Serialize)]
pub struct AssistantStreamRequest {
    pub assistant_id: String,
    pub conversation_id: String,
    pub messages: Vec<VendorMessage>,
    pub meta_data: StreamMetaData,
}

/// The single message the vendor reads
#[derive(Debug, Clone, Serialize)]
pub struct VendorMessage {
    pub role: String,
    pub content: Vec<VendorContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VendorContent {
    Text { text: String },
    File { file: Vec<FileReference> },
    Image { image: Vec<FileReference> },
}

impl VendorMessage {
    /// Text block of the message
    pub fn text(&self) -> &str {
        self.content
            .iter()
            .find_map(|c| match c {
                VendorContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamMetaData {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_mode: Option<String>,
    pub draft_id: String,
    pub if_plus_model: bool,
    pub input_question_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_networking: Option<bool>,
    pub is_test: bool,
    pub platform: String,
    pub quote_log_id: String,
}

impl StreamMetaData {
    fn base() -> Self {
        Self {
            channel: String::new(),
            chat_mode: None,
            draft_id: String::new(),
            if_plus_model: true,
            input_question_type: "xxxx".to_string(),
            is_networking: None,
            is_test: false,
            platform: "pc".to_string(),
            quote_log_id: String::new(),
        }
    }

    /// Chat turns run with networking on
    pub fn chat(chat_mode: Option<ChatMode>) -> Self {
        Self {
            chat_mode: chat_mode.map(|m| m.as_str().to_string()),
            is_networking: Some(true),
            ..Self::base()
        }
    }

    /// Drawing assistant turns
    pub fn drawing() -> Self {
        Self::base()
    }
}

/// Body of the video generation endpoint
#[derive(Debug, Clone, Serialize)]
pub struct VideoCreateRequest {
    pub conversation_id: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_list: Option<Vec<String>>,
    pub advanced_parameter_extra: VideoParameters,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VideoParameters {
    pub emotional_atmosphere: String,
    pub mirror_mode: String,
    pub video_style: String,
}

/// Result of starting a video task
#[derive(Debug, Clone, Deserialize)]
pub struct VideoTask {
    pub chat_id: String,
    #[serde(default)]
    pub conversation_id: String,
}

/// Poll result of a video task
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub video_duration: Value,
    #[serde(default)]
    pub resolution: Value,
}

impl VideoStatus {
    pub fn is_pending(&self) -> bool {
        self.status == "init" || self.status == "processing"
    }

    pub fn is_finished(&self) -> bool {
        self.status == "finished"
    }
}

/// Body of the audio composite endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CompositeVideoRequest {
    pub chat_id: String,
    pub key: String,
    pub audio_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompositeVideo {
    pub url: String,
}

/// Result of the token refresh endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResult {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_reference_keeps_vendor_fields() {
        let reference: FileReference = serde_json::from_value(json!({
            "file_id": "f1",
            "file_url": "https://oss/f1.png",
            "width": 640,
            "height": 480,
            "file_name": "a.png"
        }))
        .unwrap();

        assert!(reference.is_image());
        assert_eq!(reference.extra["file_name"], "a.png");

        let value = serde_json::to_value(&reference).unwrap();
        assert_eq!(value["file_id"], "f1");
        assert_eq!(value["file_url"], "https://oss/f1.png");
        assert_eq!(value["file_name"], "a.png");
        assert!(value.get("image_url").is_none());
    }

    #[test]
    fn test_video_upload_uses_source_id() {
        let reference: FileReference =
            serde_json::from_value(json!({"source_id": "s1", "source_url": "https://oss/s1.jpg"})).unwrap();
        assert_eq!(reference.id, "s1");
        assert!(!reference.is_image());
    }

    #[test]
    fn test_stream_meta_data() {
        let chat = serde_json::to_value(StreamMetaData::chat(Some(ChatMode::Zero))).unwrap();
        assert_eq!(chat["chat_mode"], "zero");
        assert_eq!(chat["is_networking"], true);
        assert_eq!(chat["platform"], "pc");

        let drawing = serde_json::to_value(StreamMetaData::drawing()).unwrap();
        assert!(drawing.get("chat_mode").is_none());
        assert!(drawing.get("is_networking").is_none());
    }

    #[test]
    fn test_vendor_content_tags() {
        let message = VendorMessage {
            role: "user".to_string(),
            content: vec![VendorContent::Text { text: "hi".to_string() }],
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(message.text(), "hi");
    }
}
