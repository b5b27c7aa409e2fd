use super::events::{ContentValue, KnownValue, Status};
use super::parse_event;
use crate::providers::streaming::SseStream;
use crate::providers::ProviderError;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;

/// Markdown link targets inside finished text
static LINK_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((https?://\S+)\)").unwrap());

/// Gather the image URLs a drawing assistant produced.
///
/// Returns the conversation id and the unique http(s) URLs in order of
/// appearance. A moderation intercept fails with `ContentFiltered`.
pub async fn collect_images<S>(stream: S) -> Result<(Option<String>, Vec<String>), ProviderError>
where
    S: Stream<Item = Result<Bytes, ProviderError>>,
{
    let mut events = std::pin::pin!(SseStream::new(stream));
    let mut conversation_id: Option<String> = None;
    let mut urls: Vec<String> = Vec::new();

    while let Some(item) = events.next().await {
        let Some(event) = parse_event(&item?)? else {
            continue;
        };
        if conversation_id.is_none() {
            conversation_id = event.conversation_id.clone().filter(|id| !id.is_empty());
        }
        match event.status {
            Status::Intervene => return Err(ProviderError::ContentFiltered),
            Status::Finish => break,
            _ => {}
        }

        for part in &event.parts {
            for value in &part.content {
                let ContentValue::Known(value) = value else {
                    continue;
                };
                let finished = part.status == Status::Finish || value.status() == Some(Status::Finish);
                if !finished {
                    continue;
                }
                match value {
                    KnownValue::Image { image, .. } => {
                        for url in image.iter().filter_map(|i| i.image_url.as_deref()) {
                            if url.starts_with("http://") || url.starts_with("https://") {
                                push_unique(&mut urls, url);
                            }
                        }
                    }
                    KnownValue::Text { text, .. } => {
                        for caps in LINK_PATTERN.captures_iter(text) {
                            push_unique(&mut urls, &caps[1]);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    Ok((conversation_id, urls))
}

fn push_unique(urls: &mut Vec<String>, url: &str) {
    if !urls.iter().any(|u| u == url) {
        urls.push(url.to_string());
    }
}
