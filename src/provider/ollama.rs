//! Local Ollama backend.
//!
//! Model management (listing and pulling) goes through `ollama-rs`; the chat call
//! itself is a plain reqwest POST so status codes map onto error kinds.

use async_trait::async_trait;
use ollama_rs::Ollama;
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

use super::{http_client, retry_after, Provider, ProviderContext, ProviderRequest, Role};
use crate::config::Settings;
use crate::error::{ProviderError, ProviderErrorKind, Stage};
use crate::events::{EventSink, PipelineEvent, PullPhase};

const NAME: &str = "ollama";
const DEFAULT_PORT: u16 = 11434;

/// `llama3` and `llama3:latest` name the same model.
pub fn normalize_model(name: &str) -> String {
  let name = name.trim();
  if name.contains(':') {
    name.to_string()
  } else {
    format!("{name}:latest")
  }
}

pub struct OllamaProvider {
  client:   reqwest::Client,
  ollama:   Ollama,
  base_url: String,
  model:    String
}

impl OllamaProvider {
  pub fn new(settings: &Settings) -> Result<Self, ProviderError> {
    let invalid = |reason: String| ProviderError::new(NAME, ProviderErrorKind::Malformed, reason).at(Stage::ModelCheck);

    let url = Url::parse(&settings.ollama_url).map_err(|e| invalid(format!("invalid ollama url {:?}: {e}", settings.ollama_url)))?;
    let host = url
      .host_str()
      .ok_or_else(|| invalid(format!("ollama url {:?} has no host", settings.ollama_url)))?;
    let port = url.port().unwrap_or(DEFAULT_PORT);

    Ok(Self {
      client: http_client(NAME, settings)?,
      ollama: Ollama::new(format!("{}://{}", url.scheme(), host), port),
      base_url: format!("{}://{}:{}", url.scheme(), host, port),
      model: settings.model.clone()
    })
  }

  fn payload(request: &ProviderRequest, model: &str) -> Value {
    let messages: Vec<Value> = request
      .messages
      .iter()
      .map(|message| {
        let role = match message.role {
          Role::System => "system",
          Role::User => "user"
        };
        json!({ "role": role, "content": message.content })
      })
      .collect();

    json!({
      "model": model,
      "messages": messages,
      "stream": false,
      "options": {
        "temperature": request.temperature,
        "num_predict": request.max_output_tokens
      }
    })
  }
}

fn error_message(body: &str) -> String {
  serde_json::from_str::<Value>(body)
    .ok()
    .and_then(|json| json.get("error").and_then(Value::as_str).map(String::from))
    .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl Provider for OllamaProvider {
  fn name(&self) -> &'static str {
    NAME
  }

  fn model(&self) -> &str {
    &self.model
  }

  async fn prepare(&self, run_id: Uuid, events: &dyn EventSink) -> Result<ProviderContext, ProviderError> {
    let _profile = crate::Profile::new("Ollama model check");
    let wanted = normalize_model(&self.model);

    let models = self
      .ollama
      .list_local_models()
      .await
      .map_err(|e| ProviderError::new(NAME, ProviderErrorKind::Network, format!("could not list local models: {e}")).at(Stage::ModelCheck))?;

    if models.iter().any(|model| normalize_model(&model.name) == wanted) {
      log::debug!("Model {wanted} is available locally");
      return Ok(ProviderContext { model: self.model.clone(), pulled: false });
    }

    events.emit(PipelineEvent::ModelPull { run_id, model: wanted.clone(), phase: PullPhase::Started });
    self
      .ollama
      .pull_model(wanted.clone(), false)
      .await
      .map_err(|e| ProviderError::new(NAME, ProviderErrorKind::Unavailable, format!("could not pull {wanted}: {e}")).at(Stage::ModelPull))?;
    events.emit(PipelineEvent::ModelPull { run_id, model: wanted, phase: PullPhase::Finished });

    Ok(ProviderContext { model: self.model.clone(), pulled: true })
  }

  async fn complete(&self, ctx: &ProviderContext, request: &ProviderRequest) -> Result<String, ProviderError> {
    let response = self
      .client
      .post(format!("{}/api/chat", self.base_url))
      .json(&Self::payload(request, &ctx.model))
      .send()
      .await
      .map_err(|e| ProviderError::from_reqwest(NAME, &e))?;

    let status = response.status();
    if !status.is_success() {
      let delay = retry_after(response.headers());
      let body = response.text().await.unwrap_or_default();
      let kind = ProviderErrorKind::from_status(status.as_u16());
      return Err(
        ProviderError::new(NAME, kind, format!("{status}: {}", error_message(&body)))
          .with_retry_after(delay.filter(|_| kind == ProviderErrorKind::RateLimit))
      );
    }

    let json: Value = response
      .json()
      .await
      .map_err(|e| ProviderError::new(NAME, ProviderErrorKind::Malformed, format!("invalid response body: {e}")))?;

    json
      .get("message")
      .and_then(|message| message.get("content"))
      .and_then(Value::as_str)
      .map(String::from)
      .ok_or_else(|| ProviderError::new(NAME, ProviderErrorKind::Malformed, "response is missing message.content"))
  }
}
