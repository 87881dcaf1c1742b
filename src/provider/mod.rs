//! Chat completion backends.
//!
//! A [`Provider`] performs exactly one HTTP exchange per `complete` call; retries,
//! backoff and attempt events live in [`retry`]. The backend is chosen once per
//! run by [`build`].

pub mod ollama;
pub mod openai;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Serialize;
use uuid::Uuid;

use crate::config::{ProviderKind, Settings};
use crate::error::{PipelineError, ProviderError};
use crate::events::EventSink;
use crate::prompt::Prompt;

pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  System,
  User
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
  pub role:    Role,
  pub content: String
}

/// One rendered completion request. Built once, sent up to `max_attempts` times.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
  pub provider:          &'static str,
  pub model:             String,
  pub messages:          Vec<Message>,
  pub temperature:       f32,
  pub max_output_tokens: usize
}

impl ProviderRequest {
  pub fn new(provider: &'static str, model: impl Into<String>, prompt: &Prompt, temperature: f32, max_output_tokens: usize) -> Self {
    Self {
      provider,
      model: model.into(),
      messages: vec![
        Message { role: Role::System, content: prompt.system.clone() },
        Message { role: Role::User, content: prompt.user.clone() },
      ],
      temperature,
      max_output_tokens
    }
  }

  fn content(&self, role: Role) -> &str {
    self
      .messages
      .iter()
      .find(|message| message.role == role)
      .map_or("", |message| message.content.as_str())
  }

  pub fn system(&self) -> &str {
    self.content(Role::System)
  }

  pub fn user(&self) -> &str {
    self.content(Role::User)
  }
}

/// Model availability, established by [`Provider::prepare`] before the first request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderContext {
  /// Model name as the backend knows it
  pub model:  String,
  /// Whether `prepare` had to download the model
  pub pulled: bool
}

#[async_trait]
pub trait Provider: Send + Sync {
  /// Short identifier used in errors and events.
  fn name(&self) -> &'static str;

  /// Model requested by the configuration.
  fn model(&self) -> &str;

  /// Makes sure the model can serve requests. Runs once per pipeline run,
  /// outside the retry path.
  async fn prepare(&self, _run_id: Uuid, _events: &dyn EventSink) -> Result<ProviderContext, ProviderError> {
    Ok(ProviderContext { model: self.model().to_string(), pulled: false })
  }

  /// A single request/response exchange returning the raw message text.
  async fn complete(&self, ctx: &ProviderContext, request: &ProviderRequest) -> Result<String, ProviderError>;
}

/// Instantiates the configured backend.
pub fn build(settings: &Settings) -> Result<Box<dyn Provider>, PipelineError> {
  let provider: Box<dyn Provider> = match settings.provider {
    ProviderKind::OpenAI => Box::new(OpenAIProvider::new(settings)?),
    ProviderKind::Ollama => Box::new(OllamaProvider::new(settings)?)
  };
  log::debug!("Using {} provider with model {}", provider.name(), provider.model());
  Ok(provider)
}

/// Delay from a `Retry-After: <seconds>` header, if any.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
  headers
    .get(RETRY_AFTER)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.trim().parse::<u64>().ok())
    .map(Duration::from_secs)
}

/// Shared reqwest client with the per-request timeout applied.
fn http_client(provider: &'static str, settings: &Settings) -> Result<reqwest::Client, ProviderError> {
  reqwest::Client::builder()
    .timeout(settings.request_timeout)
    .connect_timeout(settings.request_timeout)
    .build()
    .map_err(|e| ProviderError::from_reqwest(provider, &e))
}
