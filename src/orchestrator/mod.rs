//! Completion orchestration: one vendor turn per request, supervised by a
//! bounded retry loop, with best-effort cleanup of ephemeral conversations.

use crate::auth::TokenCache;
use crate::cli::AppConfig;
use crate::compactor;
use crate::files::FileRelay;
use crate::models::{
    count_tokens, AssistantMessage, ChatCompletion, ChatCompletionRequest, ChatMessage, Choice, Usage,
    VideoGenerationRequest, VideoResult,
};
use crate::providers::{
    AssistantStreamRequest, ByteStream, CompositeVideoRequest, GlmUpstream, ProviderError, StreamMetaData,
    VideoCreateRequest, VideoParameters,
};
use crate::router::{valid_conversation_id, ModelProfile, Router};
use crate::transcoder::{collect, collect_images, RelayStream};
use secrecy::ExposeSecret;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Video model that first draws a reference image from the prompt
const VIDEO_PRO_MODEL: &str = "cogvideox-pro";

/// An opened vendor stream plus what the caller needs to finish the turn
struct OpenTurn {
    stream: ByteStream,
    assistant_id: String,
    profile: ModelProfile,
    prompt: String,
    resumed: bool,
}

/// Delete an ephemeral conversation in the background; failures are only logged
fn spawn_delete_conversation(
    tokens: TokenCache,
    upstream: Arc<dyn GlmUpstream>,
    refresh_token: String,
    assistant_id: String,
    conversation_id: String,
) {
    tokio::spawn(async move {
        let result = match tokens.acquire(&refresh_token).await {
            Ok(token) => {
                upstream
                    .delete_conversation(token.expose_secret(), &assistant_id, &conversation_id)
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!("Removed conversation {}", conversation_id),
            Err(e) => {
                if e.is_auth_failure() {
                    tokens.invalidate(&refresh_token);
                }
                warn!("⚠️ Failed to remove conversation {}: {}", conversation_id, e);
            }
        }
    });
}

pub struct Orchestrator {
    config: AppConfig,
    router: Router,
    tokens: TokenCache,
    upstream: Arc<dyn GlmUpstream>,
    files: FileRelay,
}

impl Orchestrator {
    pub fn new(config: &AppConfig, upstream: Arc<dyn GlmUpstream>, tokens: TokenCache) -> Result<Self, ProviderError> {
        let files = FileRelay::new(&config.files, &config.upstream, upstream.clone(), tokens.clone())?;
        Ok(Self {
            config: config.clone(),
            router: Router::new(&config.upstream),
            tokens,
            upstream,
            files,
        })
    }

    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    /// Run `attempt` until it succeeds, fails for good or runs out of retries.
    ///
    /// The delay is awaited inside the caller's future, so dropping the
    /// request also cancels any pending retry.
    async fn retrying<T, F, Fut>(&self, what: &str, refresh_token: &str, mut attempt: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_retries = self.config.retry.max_retries;
        let mut retries = 0;
        loop {
            let e = match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            error!("❌ {} failed: {}", what, e);
            if e.is_auth_failure() {
                self.tokens.invalidate(refresh_token);
            }
            if !e.is_retryable() || retries >= max_retries {
                return Err(e);
            }
            retries += 1;
            warn!(
                "⚠️ Retrying {} in {}ms [{}/{}]",
                what,
                self.config.retry.delay_ms,
                retries,
                max_retries
            );
            tokio::time::sleep(self.config.retry.delay()).await;
        }
    }

    /// Upload attachments, compact the history and open the vendor stream
    async fn open_turn(&self, request: &ChatCompletionRequest, refresh_token: &str) -> Result<OpenTurn, ProviderError> {
        let route = self.router.route(&request.model);
        let resumed = valid_conversation_id(request.conversation_id.as_deref());

        // Only the active turn's attachments are sent
        let urls = request
            .messages
            .last()
            .map(ChatMessage::attachment_urls)
            .unwrap_or_default();
        let refs = self.files.upload_all(&urls, refresh_token).await?;

        let message = compactor::prepare(&request.messages, &refs, resumed.is_some());
        let prompt = message.text().to_string();
        let body = AssistantStreamRequest {
            assistant_id: route.assistant_id.clone(),
            conversation_id: resumed.clone().unwrap_or_default(),
            messages: vec![message],
            meta_data: StreamMetaData::chat(route.chat_mode),
        };

        let token = self.tokens.acquire(refresh_token).await?;
        info!("💬 {} → assistant {}", request.model, route.assistant_id);
        let stream = self.upstream.open_chat_stream(token.expose_secret(), &body).await?;

        Ok(OpenTurn {
            stream,
            assistant_id: route.assistant_id,
            profile: route.profile,
            prompt,
            resumed: resumed.is_some(),
        })
    }

    fn cleanup(&self, refresh_token: &str, assistant_id: String, conversation_id: Option<String>) {
        if let Some(conversation_id) = conversation_id {
            spawn_delete_conversation(
                self.tokens.clone(),
                self.upstream.clone(),
                refresh_token.to_string(),
                assistant_id,
                conversation_id,
            );
        }
    }

    async fn complete_once(&self, request: &ChatCompletionRequest, refresh_token: &str) -> Result<ChatCompletion, ProviderError> {
        let turn = self.open_turn(request, refresh_token).await?;
        let started_at = Instant::now();
        let answer = collect(turn.stream, turn.profile).await?;
        info!(
            "✅ Stream has completed transfer in {}ms",
            started_at.elapsed().as_millis()
        );

        if !turn.resumed {
            self.cleanup(refresh_token, turn.assistant_id, answer.conversation_id.clone());
        }

        let usage = Usage::count(&turn.prompt, &answer.content);
        Ok(ChatCompletion {
            id: answer.conversation_id.unwrap_or_default(),
            object: "chat.completion".to_string(),
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: answer.content,
                },
                finish_reason: "stop".to_string(),
            }],
            usage,
            created: chrono::Utc::now().timestamp(),
        })
    }

    /// Buffered chat completion
    pub async fn create_completion(
        &self,
        request: &ChatCompletionRequest,
        refresh_token: &str,
    ) -> Result<ChatCompletion, ProviderError> {
        self.retrying("Chat completion", refresh_token, || self.complete_once(request, refresh_token))
            .await
    }

    /// Live chat completion.
    ///
    /// Retries cover opening the stream; once frames flow, failures end the
    /// relayed body instead.
    pub async fn create_completion_stream(
        &self,
        request: &ChatCompletionRequest,
        refresh_token: &str,
    ) -> Result<RelayStream<ByteStream>, ProviderError> {
        let turn = self
            .retrying("Chat completion stream", refresh_token, || self.open_turn(request, refresh_token))
            .await?;

        let relay = RelayStream::new(turn.stream, request.model.clone(), turn.profile)
            .with_prompt_tokens(count_tokens(&turn.prompt));
        if turn.resumed {
            return Ok(relay);
        }

        let tokens = self.tokens.clone();
        let upstream = self.upstream.clone();
        let refresh_token = refresh_token.to_string();
        let assistant_id = turn.assistant_id;
        Ok(relay.on_complete(move |outcome| {
            if let Some(conversation_id) = outcome.conversation_id.clone() {
                spawn_delete_conversation(tokens, upstream, refresh_token, assistant_id, conversation_id);
            }
        }))
    }

    async fn images_once(&self, model: Option<&str>, prompt: &str, refresh_token: &str) -> Result<Vec<String>, ProviderError> {
        let assistant_id = self.router.image_assistant(model);
        let prompt = if prompt.contains('画') {
            prompt.to_string()
        } else {
            format!("请画：{}", prompt)
        };
        let message = compactor::prepare(&[ChatMessage::text("user", prompt)], &[], false);
        let body = AssistantStreamRequest {
            assistant_id: assistant_id.clone(),
            conversation_id: String::new(),
            messages: vec![message],
            meta_data: StreamMetaData::drawing(),
        };

        let token = self.tokens.acquire(refresh_token).await?;
        info!("🎨 Drawing with assistant {}", assistant_id);
        let stream = self.upstream.open_chat_stream(token.expose_secret(), &body).await?;
        let (conversation_id, urls) = collect_images(stream).await?;

        self.cleanup(refresh_token, assistant_id, conversation_id);
        if urls.is_empty() {
            return Err(ProviderError::GenerationFailed("no image was generated".to_string()));
        }
        Ok(urls)
    }

    /// Draw images with the drawing assistant
    pub async fn generate_images(
        &self,
        model: Option<&str>,
        prompt: &str,
        refresh_token: &str,
    ) -> Result<Vec<String>, ProviderError> {
        self.retrying("Image generation", refresh_token, || self.images_once(model, prompt, refresh_token))
            .await
    }

    async fn videos_once(&self, request: &VideoGenerationRequest, refresh_token: &str) -> Result<Vec<VideoResult>, ProviderError> {
        let resumed = valid_conversation_id(request.conversation_id.as_deref());

        let mut image_url = request.image_url.clone();
        if request.model.as_deref() == Some(VIDEO_PRO_MODEL) {
            let urls = self.images_once(None, &request.prompt, refresh_token).await?;
            image_url = urls.into_iter().next();
        }
        let source_list = match &image_url {
            Some(url) => Some(vec![self.files.upload(url, refresh_token, true).await?.id]),
            None => None,
        };

        let body = VideoCreateRequest {
            conversation_id: resumed.unwrap_or_default(),
            prompt: request.prompt.clone(),
            source_list,
            advanced_parameter_extra: VideoParameters {
                emotional_atmosphere: request
                    .emotional_atmosphere
                    .map(|a| a.as_str().to_string())
                    .unwrap_or_default(),
                mirror_mode: request.mirror_mode.map(|m| m.as_str().to_string()).unwrap_or_default(),
                video_style: request.video_style.map(|s| s.as_str().to_string()).unwrap_or_default(),
            },
        };
        let token = self.tokens.acquire(refresh_token).await?;
        let task = self.upstream.create_video(token.expose_secret(), &body).await?;
        info!("🎬 Video task {} started", task.chat_id);

        let started_at = Instant::now();
        let poll_timeout = std::time::Duration::from_secs(self.config.video.poll_timeout_secs);
        let poll_interval = std::time::Duration::from_millis(self.config.video.poll_interval_ms);
        let status = loop {
            if started_at.elapsed() > poll_timeout {
                return Err(ProviderError::GenerationFailed(format!(
                    "video task {} did not finish within {}s",
                    task.chat_id,
                    poll_timeout.as_secs()
                )));
            }
            let token = self.tokens.acquire(refresh_token).await?;
            let status = self.upstream.video_status(token.expose_secret(), &task.chat_id).await?;
            if !status.is_pending() {
                break status;
            }
            debug!("Video task {} is {}", task.chat_id, status.status);
            tokio::time::sleep(poll_interval).await;
        };
        if !status.is_finished() {
            return Err(ProviderError::GenerationFailed(
                status.msg.unwrap_or_else(|| format!("video task ended with status {}", status.status)),
            ));
        }

        let mut video_url = status.video_url;
        if let Some(audio_id) = &request.audio_id {
            let (key, id) = audio_id.split_once('-').unwrap_or((audio_id.as_str(), ""));
            let token = self.tokens.acquire(refresh_token).await?;
            let composite = CompositeVideoRequest {
                chat_id: task.chat_id.clone(),
                key: key.to_string(),
                audio_id: id.to_string(),
            };
            video_url = Some(self.upstream.composite_video(token.expose_secret(), &composite).await?);
        }

        let upstream = self.upstream.clone();
        let chat_id = task.chat_id.clone();
        let access_token = token.expose_secret().to_string();
        tokio::spawn(async move {
            if let Err(e) = upstream.delete_video(&access_token, &chat_id).await {
                warn!("⚠️ Failed to remove video task {}: {}", chat_id, e);
            }
        });

        Ok(vec![VideoResult {
            conversation_id: task.conversation_id,
            cover_url: status.cover_url,
            video_url,
            video_duration: status.video_duration,
            resolution: status.resolution,
        }])
    }

    /// Generate a video, optionally from a reference image and with a soundtrack
    pub async fn generate_videos(
        &self,
        request: &VideoGenerationRequest,
        refresh_token: &str,
    ) -> Result<Vec<VideoResult>, ProviderError> {
        self.retrying("Video generation", refresh_token, || self.videos_once(request, refresh_token))
            .await
    }
}
