use super::parse_event;
use super::state::{TranscoderState, TurnEnd};
use crate::models::{count_tokens, ChatCompletionChunk, ChunkChoice, Delta, Usage};
use crate::providers::streaming::SseStream;
use crate::providers::ProviderError;
use crate::router::ModelProfile;
use bytes::Bytes;
use futures::stream::Stream;
use pin_project::{pin_project, pinned_drop};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{error, info, warn};

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// What a relayed turn produced, handed to the completion hook
#[derive(Debug, Clone, Default)]
pub struct RelayOutcome {
    pub conversation_id: Option<String>,
    pub content: String,
    pub intervened: bool,
    pub usage: Usage,
}

type CompletionHook = Box<dyn FnOnce(&RelayOutcome) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Streaming,
    Done,
}

/// Frame building and bookkeeping, kept apart from the pinned upstream
struct RelayCore {
    state: TranscoderState,
    model: String,
    created: i64,
    prompt_tokens: u32,
    content: String,
    queued: VecDeque<Bytes>,
    phase: Phase,
    started_at: Instant,
    on_complete: Vec<CompletionHook>,
}

impl RelayCore {
    fn chunk(&self, id: &str, delta: Delta, finish_reason: Option<&str>, usage: Option<Usage>) -> Result<Bytes, ProviderError> {
        let chunk = ChatCompletionChunk {
            id: id.to_string(),
            model: self.model.clone(),
            object: "chat.completion.chunk".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(|r| r.to_string()),
            }],
            usage,
            created: self.created,
        };
        Ok(Bytes::from(format!("data: {}\n\n", serde_json::to_string(&chunk)?)))
    }

    fn conversation_id(&self) -> String {
        self.state.conversation_id().unwrap_or_default().to_string()
    }

    fn queue_content(&mut self, text: String) -> Result<(), ProviderError> {
        if text.is_empty() {
            return Ok(());
        }
        let frame = self.chunk(
            &self.conversation_id(),
            Delta {
                role: None,
                content: Some(text.clone()),
            },
            None,
            None,
        )?;
        self.content.push_str(&text);
        self.queued.push_back(frame);
        Ok(())
    }

    fn start(&mut self) -> Result<(), ProviderError> {
        let frame = self.chunk(
            "",
            Delta {
                role: Some("assistant".to_string()),
                content: Some(String::new()),
            },
            None,
            None,
        )?;
        self.queued.push_back(frame);
        self.phase = Phase::Streaming;
        Ok(())
    }

    /// Emit the tail, the stop frame and the end sentinel
    fn finish(&mut self, end: Option<TurnEnd>) -> Result<(), ProviderError> {
        let mut tail = self.state.finalize();
        let intervened = matches!(end, Some(TurnEnd::Intervened { .. }));
        if let Some(TurnEnd::Intervened { notice: Some(notice) }) = &end {
            tail.push_str(&format!("\n\n{}", notice));
        }
        self.queue_content(tail)?;

        let completion_tokens = count_tokens(&self.content);
        let usage = Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens,
            total_tokens: self.prompt_tokens + completion_tokens,
        };
        let stop = self.chunk(&self.conversation_id(), Delta::default(), Some("stop"), Some(usage))?;
        self.queued.push_back(stop);
        self.queued.push_back(Bytes::from_static(DONE_FRAME));
        self.phase = Phase::Done;

        info!(
            "✅ Stream has completed transfer in {}ms",
            self.started_at.elapsed().as_millis()
        );

        let outcome = RelayOutcome {
            conversation_id: self.state.conversation_id().map(|id| id.to_string()),
            content: self.content.clone(),
            intervened,
            usage,
        };
        for hook in self.on_complete.drain(..) {
            hook(&outcome);
        }
        Ok(())
    }
}

/// Live chat completion chunk stream over a vendor byte stream.
///
/// Yields complete SSE frames: a role frame, one frame per content delta, a
/// stop frame with usage and `data: [DONE]`. An unparseable vendor event
/// yields an error, which aborts the response body. Dropping the stream drops
/// the upstream response.
#[pin_project(PinnedDrop)]
pub struct RelayStream<S> {
    #[pin]
    events: SseStream<S>,
    core: RelayCore,
}

impl<S> RelayStream<S> {
    pub fn new(stream: S, model: impl Into<String>, profile: ModelProfile) -> Self {
        Self {
            events: SseStream::new(stream),
            core: RelayCore {
                state: TranscoderState::new(profile),
                model: model.into(),
                created: chrono::Utc::now().timestamp(),
                prompt_tokens: 0,
                content: String::new(),
                queued: VecDeque::new(),
                phase: Phase::Start,
                started_at: Instant::now(),
                on_complete: Vec::new(),
            },
        }
    }

    /// Prompt size reported in the final usage
    pub fn with_prompt_tokens(mut self, prompt_tokens: u32) -> Self {
        self.core.prompt_tokens = prompt_tokens;
        self
    }

    /// Run a hook once the turn has been fully relayed.
    /// Hooks run in the order they were added.
    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&RelayOutcome) + Send + 'static,
    {
        self.core.on_complete.push(Box::new(hook));
        self
    }
}

impl<S> Stream for RelayStream<S>
where
    S: Stream<Item = Result<Bytes, ProviderError>>,
{
    type Item = Result<Bytes, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        let core = this.core;

        loop {
            if let Some(frame) = core.queued.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }

            let step = match core.phase {
                Phase::Done => return Poll::Ready(None),
                Phase::Start => core.start(),
                Phase::Streaming => match this.events.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(sse))) => match parse_event(&sse) {
                        Ok(None) => Ok(()),
                        Ok(Some(event)) => {
                            let emission = core.state.handle_event(&event);
                            core.queue_content(emission.delta).and_then(|_| match emission.end {
                                Some(end) => core.finish(Some(end)),
                                None => Ok(()),
                            })
                        }
                        Err(e) => Err(e),
                    },
                    Poll::Ready(Some(Err(e))) => {
                        warn!("⚠️ Upstream stream interrupted, ending relay: {}", e);
                        core.finish(None)
                    }
                    Poll::Ready(None) => core.finish(None),
                    Poll::Pending => return Poll::Pending,
                },
            };

            if let Err(e) = step {
                error!("❌ Relay aborted: {}", e);
                core.phase = Phase::Done;
                core.queued.clear();
                return Poll::Ready(Some(Err(e)));
            }
        }
    }
}

#[pinned_drop]
impl<S> PinnedDrop for RelayStream<S> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if this.core.phase != Phase::Done {
            info!("🔌 Client went away, closing upstream stream");
        }
    }
}
