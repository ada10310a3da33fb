//! Contract with the inference engine.
//!
//! The engine is opaque: it loads a model (reporting progress while it does)
//! and answers chat completions over the full message history.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::state::ChatMessage;

/// Placeholder shown while loading when the engine gives no status text
pub const DEFAULT_PROGRESS_TEXT: &str = "Downloading model...";

/// One progress report emitted while the engine is initializing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitProgress {
    pub text: Option<String>,
    /// Fraction in `0.0..=1.0`, when the engine knows it
    pub fraction: Option<f64>,
}

impl InitProgress {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), fraction: None }
    }

    /// Human-readable status, falling back to a generic placeholder
    pub fn display_text(&self) -> String {
        match self.text.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => DEFAULT_PROGRESS_TEXT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletion {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub message: ChoiceMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceMessage {
    pub content: Option<String>,
}

impl ChatCompletion {
    pub fn single(content: impl Into<String>) -> Self {
        Self {
            choices: vec![Choice {
                message: ChoiceMessage { content: Some(content.into()) },
            }],
        }
    }

    /// Content of the first choice, if it carries any text
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .filter(|c| !c.is_empty())
    }
}

/// Creates ready engine handles
#[async_trait]
pub trait EngineLoader: Send + Sync {
    /// Load `model`, sending progress reports until the handle is ready.
    ///
    /// Send errors on `progress` are ignored; the receiver going away only
    /// means nobody is watching.
    async fn load(
        &self,
        model: &str,
        progress: UnboundedSender<InitProgress>,
    ) -> Result<Arc<dyn ChatEngine>>;
}

/// A loaded engine that can answer chat completions
#[async_trait]
pub trait ChatEngine: Send + Sync {
    async fn complete_chat(&self, messages: &[ChatMessage]) -> Result<ChatCompletion>;

    /// Release engine resources. Best-effort.
    async fn dispose(&self) {}
}
