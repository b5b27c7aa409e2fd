use super::error::ProviderError;
use super::types::{
    AssistantStreamRequest, CompositeVideo, CompositeVideoRequest, FileReference, FileUpload,
    RefreshResult, UploadTarget, VideoCreateRequest, VideoStatus, VideoTask,
};
use super::{ByteStream, GlmUpstream};
use crate::auth::TokenRefresher;
use crate::cli::UpstreamConfig;
use async_trait::async_trait;
use futures::stream::TryStreamExt;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const REFRESH_PATH: &str = "/chatglm/user-api/user/refresh";
const STREAM_PATH: &str = "/chatglm/backend-api/assistant/stream";
const DELETE_CONVERSATION_PATH: &str = "/chatglm/backend-api/assistant/conversation/delete";
const FILE_UPLOAD_PATH: &str = "/chatglm/backend-api/assistant/file_upload";
const VIDEO_UPLOAD_PATH: &str = "/chatglm/video-api/v1/static/upload";
const VIDEO_CHAT_PATH: &str = "/chatglm/video-api/v1/chat";
const VIDEO_STATUS_PATH: &str = "/chatglm/video-api/v1/chat/status";
const VIDEO_COMPOSITE_PATH: &str = "/chatglm/video-api/v1/static/composite_video";

/// Unwrap the vendor envelope `{code|status, message, result}`.
///
/// A body without a numeric `code` or `status` is the result itself.
pub fn check_envelope(http_status: u16, body: Value) -> Result<Value, ProviderError> {
    let code = body.get("code").and_then(Value::as_i64);
    let status = body.get("status").and_then(Value::as_i64);

    if code.is_none() && status.is_none() {
        if http_status >= 400 {
            return Err(ProviderError::ApiError {
                status: http_status,
                code: None,
                message: body.to_string(),
            });
        }
        return Ok(body);
    }
    if code == Some(0) || status == Some(0) {
        return Ok(match body {
            Value::Object(mut map) => map.remove("result").unwrap_or(Value::Null),
            other => other,
        });
    }

    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    if message.contains("40102") {
        return Err(ProviderError::UpstreamAuth(
            "refresh token has expired, please log in again to get a new one".to_string(),
        ));
    }
    Err(ProviderError::ApiError {
        status: http_status,
        code: code.or(status),
        message,
    })
}

async fn read_envelope(response: Response) -> Result<Value, ProviderError> {
    let http_status = response.status().as_u16();
    let text = response.text().await?;
    if text.trim().is_empty() {
        return check_envelope(http_status, Value::Null);
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(body) => check_envelope(http_status, body),
        Err(_) if http_status >= 400 => Err(ProviderError::ApiError {
            status: http_status,
            code: None,
            message: text,
        }),
        Err(e) => Err(ProviderError::SerializationError(e)),
    }
}

/// HTTP client for the ChatGLM web backend
#[derive(Clone)]
pub struct GlmClient {
    client: Client,
    config: UpstreamConfig,
}

impl GlmClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ProviderError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: RequestBuilder, token: &str) -> RequestBuilder {
        builder
            .bearer_auth(token)
            .header("App-Name", "chatglm")
            .header("X-App-Platform", "pc")
            .header("X-Device-Id", uuid::Uuid::new_v4().simple().to_string())
            .header("X-Request-Id", uuid::Uuid::new_v4().simple().to_string())
    }

    async fn call<T: DeserializeOwned>(&self, builder: RequestBuilder, timeout: Duration) -> Result<T, ProviderError> {
        let response = builder.timeout(timeout).send().await?;
        let result = read_envelope(response).await?;
        Ok(serde_json::from_value(result)?)
    }
}

#[async_trait]
impl TokenRefresher for GlmClient {
    async fn refresh(&self, refresh_token: &str) -> Result<SecretString, ProviderError> {
        let builder = self
            .authorized(self.client.post(self.url(REFRESH_PATH)), refresh_token)
            .json(&json!({}));
        let result: RefreshResult = self.call(builder, self.config.auth_timeout()).await?;
        if result.access_token.is_empty() {
            return Err(ProviderError::UpstreamAuth("refresh returned no access token".to_string()));
        }
        Ok(SecretString::new(result.access_token))
    }
}

#[async_trait]
impl GlmUpstream for GlmClient {
    async fn open_chat_stream(
        &self,
        access_token: &str,
        request: &AssistantStreamRequest,
    ) -> Result<ByteStream, ProviderError> {
        let builder = self
            .authorized(self.client.post(self.url(STREAM_PATH)), access_token)
            .header("Accept", "text/event-stream")
            .json(request);

        // The timeout covers the response head only; the body may stream longer
        let timeout = self.config.stream_timeout();
        let response = tokio::time::timeout(timeout, builder.send())
            .await
            .map_err(|_| ProviderError::Timeout(format!("no stream response within {}s", timeout.as_secs())))??;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if !content_type.contains("text/event-stream") {
            let http_status = response.status().as_u16();
            // Auth failures arrive as a JSON envelope instead of a stream
            read_envelope(response).await?;
            return Err(ProviderError::ApiError {
                status: http_status,
                code: None,
                message: format!("Stream response Content-Type invalid: {}", content_type),
            });
        }

        debug!("Assistant stream opened for {}", request.assistant_id);
        Ok(Box::pin(response.bytes_stream().map_err(ProviderError::from)))
    }

    async fn delete_conversation(
        &self,
        access_token: &str,
        assistant_id: &str,
        conversation_id: &str,
    ) -> Result<(), ProviderError> {
        let builder = self
            .authorized(self.client.post(self.url(DELETE_CONVERSATION_PATH)), access_token)
            .json(&json!({
                "assistant_id": assistant_id,
                "conversation_id": conversation_id,
            }));
        let _: Value = self.call(builder, self.config.auth_timeout()).await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        access_token: &str,
        upload: FileUpload,
        target: UploadTarget,
    ) -> Result<FileReference, ProviderError> {
        let path = match target {
            UploadTarget::Chat => FILE_UPLOAD_PATH,
            UploadTarget::VideoImage => VIDEO_UPLOAD_PATH,
        };
        let part = reqwest::multipart::Part::bytes(upload.bytes)
            .file_name(upload.filename)
            .mime_str(&upload.mime)?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let builder = self
            .authorized(self.client.post(self.url(path)), access_token)
            .multipart(form);
        self.call(builder, self.config.transfer_timeout()).await
    }

    async fn create_video(
        &self,
        access_token: &str,
        request: &VideoCreateRequest,
    ) -> Result<VideoTask, ProviderError> {
        let builder = self
            .authorized(self.client.post(self.url(VIDEO_CHAT_PATH)), access_token)
            .json(request);
        self.call(builder, self.config.video_timeout()).await
    }

    async fn video_status(&self, access_token: &str, chat_id: &str) -> Result<VideoStatus, ProviderError> {
        let url = self.url(&format!("{}/{}", VIDEO_STATUS_PATH, chat_id));
        let builder = self.authorized(self.client.get(url), access_token);
        self.call(builder, self.config.video_timeout()).await
    }

    async fn composite_video(
        &self,
        access_token: &str,
        request: &CompositeVideoRequest,
    ) -> Result<String, ProviderError> {
        let builder = self
            .authorized(self.client.post(self.url(VIDEO_COMPOSITE_PATH)), access_token)
            .json(request);
        let result: CompositeVideo = self.call(builder, self.config.video_timeout()).await?;
        Ok(result.url)
    }

    async fn delete_video(&self, access_token: &str, chat_id: &str) -> Result<(), ProviderError> {
        let url = self.url(&format!("{}/{}", VIDEO_CHAT_PATH, chat_id));
        let builder = self.authorized(self.client.delete(url), access_token);
        let _: Value = self.call(builder, self.config.video_timeout()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_success_unwraps_result() {
        let result = check_envelope(200, json!({"code": 0, "message": "ok", "result": {"a": 1}})).unwrap();
        assert_eq!(result, json!({"a": 1}));

        let result = check_envelope(200, json!({"status": 0, "result": [1]})).unwrap();
        assert_eq!(result, json!([1]));
    }

    #[test]
    fn test_envelope_without_code_is_the_result() {
        let body = json!({"status": "ok", "url": "https://x"});
        assert_eq!(check_envelope(200, body.clone()).unwrap(), body);
        assert!(matches!(
            check_envelope(502, json!({"detail": "bad gateway"})),
            Err(ProviderError::ApiError { status: 502, .. })
        ));
    }

    #[test]
    fn test_envelope_errors() {
        let err = check_envelope(200, json!({"code": 401, "message": "token invalid"})).unwrap_err();
        assert!(err.is_auth_failure());

        let err = check_envelope(200, json!({"code": 10002, "message": "error 40102"})).unwrap_err();
        assert!(matches!(err, ProviderError::UpstreamAuth(_)));

        let err = check_envelope(500, json!({"status": 10001, "message": "busy"})).unwrap_err();
        assert!(matches!(
            err,
            ProviderError::ApiError { status: 500, code: Some(10001), ref message } if message == "busy"
        ));
        assert!(err.is_retryable());
    }
}
