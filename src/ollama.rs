use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::engine::{ChatCompletion, ChatEngine, EngineLoader, InitProgress};
use crate::state::ChatMessage;

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaChatMessage>,
}

#[derive(Serialize)]
struct OllamaPullRequest<'a> {
    model: &'a str,
    stream: bool,
}

/// One line of the streamed `/api/pull` response
#[derive(Debug, Deserialize)]
struct PullStatus {
    #[serde(default)]
    status: String,
    total: Option<u64>,
    completed: Option<u64>,
    error: Option<String>,
}

#[derive(Serialize)]
struct OllamaUnloadRequest<'a> {
    model: &'a str,
    keep_alive: u32,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

#[derive(Deserialize)]
struct OllamaModelsResponse {
    models: Vec<OllamaModel>,
}

impl PullStatus {
    fn to_progress(&self) -> InitProgress {
        let fraction = match (self.completed, self.total) {
            (Some(done), Some(total)) if total > 0 => Some((done as f64 / total as f64).min(1.0)),
            _ => None,
        };
        let text = match fraction {
            Some(f) if !self.status.is_empty() => {
                Some(format!("{} ({:.0}%)", self.status, f * 100.0))
            }
            _ => Some(self.status.clone()),
        };
        InitProgress { text, fraction }
    }
}

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Send the whole conversation to `/api/chat` and return the reply text
    pub async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<Option<String>> {
        let url = format!("{}/api/chat", self.base_url);

        let request = OllamaChatRequest {
            model,
            messages,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Ollama chat error {}: {}", status, text));
        }

        let chat_response: OllamaChatResponse = response.json().await?;
        Ok(chat_response.message.map(|m| m.content))
    }

    /// Download `model` if needed, reporting each streamed status line
    pub async fn pull(&self, model: &str, progress: &UnboundedSender<InitProgress>) -> Result<()> {
        let url = format!("{}/api/pull", self.base_url);

        let request = OllamaPullRequest { model, stream: true };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Ollama pull failed with status {}: {}", status, text));
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut last_status = String::new();

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(status) = handle_pull_line(&line, progress)? {
                    last_status = status;
                }
            }
        }
        if let Some(status) = handle_pull_line(&buffer, progress)? {
            last_status = status;
        }

        if last_status != "success" {
            return Err(anyhow!("Ollama pull ended before completing (last status: {:?})", last_status));
        }
        Ok(())
    }

    /// Ask Ollama to evict `model` from memory
    pub async fn unload(&self, model: &str) -> Result<()> {
        let url = format!("{}/api/generate", self.base_url);

        let request = OllamaUnloadRequest { model, keep_alive: 0 };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("Failed to unload model: {}", response.status()));
        }
        Ok(())
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(anyhow!("Failed to list models: {}", response.status()));
        }

        let models_response: OllamaModelsResponse = response.json().await?;
        let model_names: Vec<String> = models_response
            .models
            .into_iter()
            .map(|model| model.name)
            .collect();

        Ok(model_names)
    }

    pub async fn has_model(&self, name: &str) -> Result<bool> {
        let models = self.list_models().await?;
        let tagged = format!("{}:latest", name);
        Ok(models.iter().any(|m| m == name || *m == tagged))
    }
}

/// Parse one NDJSON line, forward its progress and return its status
fn handle_pull_line(
    line: &[u8],
    progress: &UnboundedSender<InitProgress>,
) -> Result<Option<String>> {
    let trimmed = std::str::from_utf8(line)?.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let status: PullStatus = serde_json::from_str(trimmed)?;
    if let Some(error) = &status.error {
        return Err(anyhow!("Ollama pull failed: {}", error));
    }

    let _ = progress.send(status.to_progress());
    Ok(Some(status.status))
}

#[async_trait]
impl EngineLoader for OllamaClient {
    async fn load(
        &self,
        model: &str,
        progress: UnboundedSender<InitProgress>,
    ) -> Result<Arc<dyn ChatEngine>> {
        let _ = progress.send(InitProgress::text(format!("Connecting to Ollama at {}", self.base_url)));

        let present = self.has_model(model).await.map_err(|e| {
            anyhow!("Could not reach Ollama at {} ({}). Make sure Ollama is running with: ollama serve", self.base_url, e)
        })?;

        if present {
            debug!(model, "model already available locally");
            let _ = progress.send(InitProgress::text(format!("Found {} locally", model)));
        } else {
            debug!(model, "pulling model");
            self.pull(model, &progress).await?;
        }

        Ok(Arc::new(OllamaEngine {
            client: self.clone(),
            model: model.to_string(),
        }))
    }
}

/// A model served by Ollama, ready for chat
pub struct OllamaEngine {
    client: OllamaClient,
    model: String,
}

#[async_trait]
impl ChatEngine for OllamaEngine {
    async fn complete_chat(&self, messages: &[ChatMessage]) -> Result<ChatCompletion> {
        let reply = self.client.chat(&self.model, messages).await?;
        Ok(reply.map(ChatCompletion::single).unwrap_or_default())
    }

    async fn dispose(&self) {
        if let Err(e) = self.client.unload(&self.model).await {
            warn!(model = %self.model, error = %e, "failed to unload model");
        }
    }
}
