pub mod error;
pub mod glm;
pub mod streaming;
pub mod types;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use std::pin::Pin;

pub use error::ProviderError;
pub use glm::GlmClient;
pub use types::{
    AssistantStreamRequest, CompositeVideoRequest, FileReference, FileUpload, StreamMetaData,
    UploadTarget, VendorContent, VendorMessage, VideoCreateRequest, VideoParameters, VideoStatus,
    VideoTask,
};

/// Raw body of a vendor event stream
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Calls against the ChatGLM web backend.
///
/// Every method takes an access token from the token cache. Implemented by
/// [`GlmClient`]; tests substitute scripted fakes.
#[async_trait]
pub trait GlmUpstream: Send + Sync {
    /// Open the assistant event stream for one turn
    async fn open_chat_stream(
        &self,
        access_token: &str,
        request: &AssistantStreamRequest,
    ) -> Result<ByteStream, ProviderError>;

    /// Remove a conversation from the user's history
    async fn delete_conversation(
        &self,
        access_token: &str,
        assistant_id: &str,
        conversation_id: &str,
    ) -> Result<(), ProviderError>;

    /// Multipart upload of an attachment
    async fn upload_file(
        &self,
        access_token: &str,
        upload: FileUpload,
        target: UploadTarget,
    ) -> Result<FileReference, ProviderError>;

    /// Start a video generation task
    async fn create_video(
        &self,
        access_token: &str,
        request: &VideoCreateRequest,
    ) -> Result<VideoTask, ProviderError>;

    /// Poll a video generation task
    async fn video_status(&self, access_token: &str, chat_id: &str) -> Result<VideoStatus, ProviderError>;

    /// Lay a soundtrack over a finished video, returning the new video URL
    async fn composite_video(
        &self,
        access_token: &str,
        request: &CompositeVideoRequest,
    ) -> Result<String, ProviderError>;

    /// Remove a video task from the user's history
    async fn delete_video(&self, access_token: &str, chat_id: &str) -> Result<(), ProviderError>;
}
