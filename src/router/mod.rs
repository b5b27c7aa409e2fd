use crate::cli::UpstreamConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

/// Model names that are themselves vendor assistant ids
static ASSISTANT_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]{24,}$").unwrap());

/// Vendor conversation ids (resumable conversations)
static CONVERSATION_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9a-zA-Z]{24}").unwrap());

/// Vendor chat mode selected by the model name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    /// Reasoning ("zero") mode
    Zero,
    DeepResearch,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Zero => "zero",
            ChatMode::DeepResearch => "deep_research",
        }
    }
}

impl std::fmt::Display for ChatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the transcoder should treat thinking and citation content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelProfile {
    /// Model streams reasoning that is surfaced in `<think>` blocks
    pub reasoning: bool,
    /// Model output carries no thinking or search progress
    pub silent: bool,
}

impl ModelProfile {
    pub fn for_model(model: &str) -> Self {
        Self {
            reasoning: model.contains("think") || model.contains("zero"),
            silent: model.contains("silent"),
        }
    }
}

/// Routing decision for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub assistant_id: String,
    pub chat_mode: Option<ChatMode>,
    pub profile: ModelProfile,
}

/// Maps OpenAI-style model names onto vendor assistants and modes
#[derive(Debug, Clone)]
pub struct Router {
    default_assistant_id: String,
    image_assistant_id: String,
}

impl Router {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            default_assistant_id: config.default_assistant_id.clone(),
            image_assistant_id: config.image_assistant_id.clone(),
        }
    }

    /// Drawing assistant for image generation
    pub fn image_assistant(&self, model: Option<&str>) -> String {
        match model {
            Some(model) if ASSISTANT_ID_PATTERN.is_match(model) => model.to_string(),
            _ => self.image_assistant_id.clone(),
        }
    }

    pub fn route(&self, model: &str) -> RouteDecision {
        let assistant_id = if ASSISTANT_ID_PATTERN.is_match(model) {
            model.to_string()
        } else {
            self.default_assistant_id.clone()
        };

        // deepresearch wins when both markers are present
        let chat_mode = if model.contains("deepresearch") {
            Some(ChatMode::DeepResearch)
        } else if model.contains("think") || model.contains("zero") {
            Some(ChatMode::Zero)
        } else {
            None
        };

        if let Some(mode) = chat_mode {
            info!("🧠 Model {} uses chat mode {}", model, mode);
        }

        RouteDecision {
            assistant_id,
            chat_mode,
            profile: ModelProfile::for_model(model),
        }
    }
}

/// Keep a caller supplied conversation id only if it looks like a vendor id
pub fn valid_conversation_id(id: Option<&str>) -> Option<String> {
    id.filter(|id| CONVERSATION_ID_PATTERN.is_match(id))
        .map(|id| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(&UpstreamConfig::default())
    }

    #[test]
    fn test_default_assistant_for_plain_models() {
        let decision = router().route("glm-4");
        assert_eq!(decision.assistant_id, "65940acff94777010aa6b796");
        assert_eq!(decision.chat_mode, None);
        assert_eq!(decision.profile, ModelProfile::default());
    }

    #[test]
    fn test_assistant_id_as_model() {
        let decision = router().route("65a232c082ff90a2ad2f15e2");
        assert_eq!(decision.assistant_id, "65a232c082ff90a2ad2f15e2");

        // Upper case or short names are not assistant ids
        let decision = router().route("65A232C082FF90A2AD2F15E2");
        assert_eq!(decision.assistant_id, "65940acff94777010aa6b796");
    }

    #[test]
    fn test_reasoning_models() {
        let think = router().route("glm-4-think");
        assert_eq!(think.chat_mode, Some(ChatMode::Zero));
        assert!(think.profile.reasoning);
        assert!(!think.profile.silent);

        let zero = router().route("glm-zero-silent");
        assert_eq!(zero.chat_mode, Some(ChatMode::Zero));
        assert!(zero.profile.reasoning);
        assert!(zero.profile.silent);
    }

    #[test]
    fn test_deep_research_mode() {
        let decision = router().route("glm-4-deepresearch");
        assert_eq!(decision.chat_mode, Some(ChatMode::DeepResearch));
        assert_eq!(decision.chat_mode.map(|m| m.as_str()), Some("deep_research"));
        assert!(!decision.profile.reasoning);
    }

    #[test]
    fn test_image_assistant() {
        assert_eq!(router().image_assistant(None), "65a232c082ff90a2ad2f15e2");
        assert_eq!(router().image_assistant(Some("cogview-3")), "65a232c082ff90a2ad2f15e2");
        assert_eq!(
            router().image_assistant(Some("659e54b1b8006379b4b2abd6")),
            "659e54b1b8006379b4b2abd6"
        );
    }

    #[test]
    fn test_conversation_id_validation() {
        assert_eq!(
            valid_conversation_id(Some("65f1a2b3c4d5e6f7a8b9c0d1")),
            Some("65f1a2b3c4d5e6f7a8b9c0d1".to_string())
        );
        assert_eq!(valid_conversation_id(Some("short")), None);
        assert_eq!(valid_conversation_id(Some("")), None);
        assert_eq!(valid_conversation_id(None), None);
    }
}
