use super::state::{TranscoderState, TurnEnd};
use super::parse_event;
use crate::providers::streaming::SseStream;
use crate::providers::ProviderError;
use crate::router::ModelProfile;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use tracing::{debug, warn};

/// Whole answer of one turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalAnswer {
    pub conversation_id: Option<String>,
    pub content: String,
    /// The vendor moderation stopped the turn
    pub intervened: bool,
}

/// Buffer a vendor byte stream into the final answer.
///
/// A transport error or an early close still resolves with the content
/// gathered so far; only an unparseable event fails.
pub async fn collect<S>(stream: S, profile: ModelProfile) -> Result<FinalAnswer, ProviderError>
where
    S: Stream<Item = Result<Bytes, ProviderError>>,
{
    let mut events = std::pin::pin!(SseStream::new(stream));
    let mut state = TranscoderState::new(profile);
    let mut content = String::new();
    let mut intervened = false;

    while let Some(item) = events.next().await {
        let sse = match item {
            Ok(sse) => sse,
            Err(e) => {
                warn!("⚠️ Upstream stream interrupted, keeping partial answer: {}", e);
                break;
            }
        };
        let Some(event) = parse_event(&sse)? else {
            continue;
        };
        debug!("Vendor event status {:?}", event.status);

        let emission = state.handle_event(&event);
        content.push_str(&emission.delta);
        match emission.end {
            Some(TurnEnd::Finished) => break,
            Some(TurnEnd::Intervened { .. }) => {
                intervened = true;
                break;
            }
            None => {}
        }
    }

    content.push_str(&state.finalize());
    Ok(FinalAnswer {
        conversation_id: state.conversation_id().map(|id| id.to_string()),
        content,
        intervened,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(events: &[&str]) -> Vec<Result<Bytes, ProviderError>> {
        events
            .iter()
            .map(|e| Ok(Bytes::from(format!("data: {}\n\n", e))))
            .collect()
    }

    #[tokio::test]
    async fn test_collect_search_answer() {
        let stream = futures::stream::iter(frames(&[
            r#"{"conversation_id":"c1","status":"processing","parts":[{"content":[{"type":"text","status":"init","text":"Hel"}]}]}"#,
            r#"{"conversation_id":"c1","status":"processing","parts":[{"content":[{"type":"text","status":"finish","text":"Hello"}]}]}"#,
            r#"{"conversation_id":"c1","status":"finish"}"#,
        ]));

        let answer = collect(stream, ModelProfile::default()).await.unwrap();
        assert_eq!(answer.content, "Hello");
        assert_eq!(answer.conversation_id.as_deref(), Some("c1"));
        assert!(!answer.intervened);
    }

    #[tokio::test]
    async fn test_collect_keeps_partial_answer_on_transport_error() {
        let mut items = frames(&[
            r#"{"status":"processing","parts":[{"content":[{"type":"text","status":"init","text":"partial"}]}]}"#,
        ]);
        items.push(Err(ProviderError::MalformedStream("connection reset".to_string())));

        let answer = collect(futures::stream::iter(items), ModelProfile::default())
            .await
            .unwrap();
        assert_eq!(answer.content, "partial");
    }

    #[tokio::test]
    async fn test_collect_fails_on_malformed_event() {
        let stream = futures::stream::iter(frames(&["{oops"]));
        let result = collect(stream, ModelProfile::default()).await;
        assert!(matches!(result, Err(ProviderError::MalformedStream(_))));
    }

    #[tokio::test]
    async fn test_collect_returns_accumulated_on_intervene() {
        let stream = futures::stream::iter(frames(&[
            r#"{"status":"processing","parts":[{"content":[{"type":"text","status":"init","text":"so far"}]}]}"#,
            r#"{"status":"intervene","last_error":{"intervene_text":"blocked"}}"#,
        ]));
        let answer = collect(stream, ModelProfile::default()).await.unwrap();
        assert_eq!(answer.content, "so far");
        assert!(answer.intervened);
    }
}
