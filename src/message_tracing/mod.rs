//! Message tracing for debugging
//!
//! Logs chat requests and answers to a JSONL file.

use crate::cli::TracingConfig;
use crate::models::{ChatCompletionRequest, ChatMessage, Usage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

/// Message tracer that writes to JSONL file
pub struct MessageTracer {
    config: TracingConfig,
    file: Option<Mutex<File>>,
}

/// A trace entry for a request
#[derive(Serialize)]
struct RequestTrace<'a> {
    ts: DateTime<Utc>,
    dir: &'static str,
    id: &'a str,
    model: &'a str,
    conversation_id: Option<&'a str>,
    is_stream: bool,
    messages: Vec<&'a ChatMessage>,
}

/// A trace entry for an answer
#[derive(Serialize)]
struct ResponseTrace<'a> {
    ts: DateTime<Utc>,
    dir: &'static str,
    id: &'a str,
    latency_ms: u64,
    prompt_tokens: u32,
    completion_tokens: u32,
    content: &'a str,
}

/// A trace entry for an error
#[derive(Serialize)]
struct ErrorTrace<'a> {
    ts: DateTime<Utc>,
    dir: &'static str,
    id: &'a str,
    error: &'a str,
}

impl MessageTracer {
    /// Create a new tracer from config
    pub fn new(config: TracingConfig) -> Self {
        if !config.enabled {
            return Self { config, file: None };
        }

        let path = expand_tilde(&config.path);

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!("Failed to create tracing directory: {}", e);
                return Self { config, file: None };
            }
        }

        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                tracing::info!("📝 Message tracing enabled: {}", path.display());
                Self {
                    config,
                    file: Some(Mutex::new(file)),
                }
            }
            Err(e) => {
                tracing::error!("Failed to open trace file: {}", e);
                Self { config, file: None }
            }
        }
    }

    /// Generate a new trace ID
    pub fn new_trace_id(&self) -> String {
        if self.file.is_some() {
            Uuid::new_v4().to_string()[..8].to_string()
        } else {
            String::new()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Trace an incoming chat request
    pub fn trace_request(&self, id: &str, request: &ChatCompletionRequest) {
        let Some(ref file_mutex) = self.file else {
            return;
        };

        let messages = request
            .messages
            .iter()
            .filter(|m| !(self.config.omit_system_prompt && m.role == "system"))
            .collect();

        let trace = RequestTrace {
            ts: Utc::now(),
            dir: "req",
            id,
            model: &request.model,
            conversation_id: request.conversation_id.as_deref(),
            is_stream: request.is_stream(),
            messages,
        };

        self.write_trace(&trace, file_mutex);
    }

    /// Trace a completed answer
    pub fn trace_response(&self, id: &str, content: &str, usage: &Usage, latency_ms: u64) {
        let Some(ref file_mutex) = self.file else {
            return;
        };

        let trace = ResponseTrace {
            ts: Utc::now(),
            dir: "res",
            id,
            latency_ms,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            content,
        };

        self.write_trace(&trace, file_mutex);
    }

    pub fn trace_error(&self, id: &str, error: &str) {
        let Some(ref file_mutex) = self.file else {
            return;
        };

        let trace = ErrorTrace {
            ts: Utc::now(),
            dir: "err",
            id,
            error,
        };

        self.write_trace(&trace, file_mutex);
    }

    fn write_trace<T: Serialize>(&self, trace: &T, file_mutex: &Mutex<File>) {
        let Ok(json) = serde_json::to_string(trace) else {
            return;
        };

        if let Ok(mut file) = file_mutex.lock() {
            let _ = writeln!(file, "{}", json);
        }
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracer(dir: &TempDir, omit_system_prompt: bool) -> (MessageTracer, PathBuf) {
        let path = dir.path().join("traces").join("trace.jsonl");
        let tracer = MessageTracer::new(TracingConfig {
            enabled: true,
            path: path.to_string_lossy().to_string(),
            omit_system_prompt,
        });
        (tracer, path)
    }

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "glm-4".to_string(),
            conversation_id: None,
            messages: vec![ChatMessage::text("system", "secret rules"), ChatMessage::text("user", "hi")],
            stream: Some(true),
        }
    }

    fn lines(path: &PathBuf) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_disabled_tracer_writes_nothing() {
        let tracer = MessageTracer::new(TracingConfig::default());
        assert!(!tracer.is_enabled());
        assert!(tracer.new_trace_id().is_empty());
        tracer.trace_error("x", "boom");
    }

    #[test]
    fn test_request_response_and_error_lines() {
        let dir = TempDir::new().unwrap();
        let (tracer, path) = tracer(&dir, true);
        let id = tracer.new_trace_id();
        assert_eq!(id.len(), 8);

        tracer.trace_request(&id, &request());
        tracer.trace_response(&id, "Hello", &Usage::count("hi", "Hello"), 12);
        tracer.trace_error(&id, "boom");

        let entries = lines(&path);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["dir"], "req");
        assert_eq!(entries[0]["is_stream"], true);
        assert_eq!(entries[0]["messages"].as_array().unwrap().len(), 1);
        assert_eq!(entries[1]["content"], "Hello");
        assert_eq!(entries[1]["latency_ms"], 12);
        assert_eq!(entries[2]["error"], "boom");
    }

    #[test]
    fn test_system_prompt_kept_when_configured() {
        let dir = TempDir::new().unwrap();
        let (tracer, path) = tracer(&dir, false);
        tracer.trace_request("id", &request());
        assert_eq!(lines(&path)[0]["messages"][0]["role"], "system");
    }
}
