//! Folds an OpenAI message list into the single message the vendor reads.

use crate::models::ChatMessage;
use crate::providers::{FileReference, VendorContent, VendorMessage};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Markdown image links, which the vendor would otherwise hallucinate from
static IMAGE_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[[^\]\n]*\]\([^)\n]*\)").unwrap());

/// Sandbox paths from earlier turns, to end of line
static SANDBOX_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"/mnt/data/[^\n]*").unwrap());

const FILE_ATTENTION_NOTE: &str = "关注用户最新发送文件和消息";

fn role_marker(role: &str) -> String {
    format!("<|{}|>", role)
}

fn scrub(text: &str) -> String {
    let text = IMAGE_LINK.replace_all(text, "");
    SANDBOX_PATH.replace_all(&text, "").into_owned()
}

/// Every text of every message in order, newline terminated
fn pass_through(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .flat_map(|m| m.texts())
        .map(|text| format!("{}\n", text))
        .collect()
}

/// Role-marked transcript ending with an open assistant turn
fn full_merge(messages: &[ChatMessage]) -> String {
    let mut merged = String::new();
    let last = messages.len().saturating_sub(1);

    for (index, message) in messages.iter().enumerate() {
        if index == last && message.has_attachment() {
            merged.push_str(&format!("{}\n{}\n", role_marker("system"), FILE_ATTENTION_NOTE));
        }
        let marker = role_marker(&message.role);
        for text in message.texts() {
            merged.push_str(&format!("{}\n{}\n", marker, text));
        }
    }
    merged.push_str(&format!("{}\n", role_marker("assistant")));
    merged
}

/// Build the vendor message for a turn.
///
/// A resumed conversation already holds its history upstream, so its texts
/// are passed through; otherwise a multi-turn history is merged into one
/// role-marked transcript.
pub fn prepare(messages: &[ChatMessage], refs: &[FileReference], is_resumed: bool) -> VendorMessage {
    let text = if is_resumed || messages.len() < 2 {
        pass_through(messages)
    } else {
        full_merge(messages)
    };
    let text = scrub(&text);
    debug!("Merged prompt:\n{}", text);

    let (images, files): (Vec<FileReference>, Vec<FileReference>) =
        refs.iter().cloned().partition(FileReference::is_image);
    let images: Vec<FileReference> = images
        .into_iter()
        .map(|mut image| {
            image.image_url = Some(image.url.clone());
            image
        })
        .collect();

    let mut content = vec![VendorContent::Text { text }];
    if !files.is_empty() {
        content.push(VendorContent::File { file: files });
    }
    if !images.is_empty() {
        content.push(VendorContent::Image { image: images });
    }

    VendorMessage {
        role: "user".to_string(),
        content,
    }
}
