//! OpenAI compatible cloud backend (chat completions and responses APIs).

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{http_client, retry_after, Provider, ProviderContext, ProviderRequest, Role};
use crate::config::{OpenAIMode, Settings};
use crate::error::{redact, ProviderError, ProviderErrorKind};

const NAME: &str = "openai";

/// Reasoning models reject sampling parameters and only speak the responses API.
pub fn is_reasoning_model(model: &str) -> bool {
  let model = model.trim().to_lowercase();
  ["gpt-5", "o1", "o3", "o4"]
    .iter()
    .any(|prefix| model.starts_with(prefix))
}

/// Request shape for `model`; `Auto` resolves to chat except for reasoning models.
pub fn shape_for(model: &str, mode: OpenAIMode) -> OpenAIMode {
  if is_reasoning_model(model) {
    return OpenAIMode::Responses;
  }
  match mode {
    OpenAIMode::Auto => OpenAIMode::Chat,
    other => other
  }
}

fn is_unsupported_param(err: &ProviderError, param: &str) -> bool {
  let message = err.message.to_lowercase();
  err.kind == ProviderErrorKind::Malformed
    && (message.contains("unsupported_parameter") || message.contains("unsupported parameter") || message.contains("not supported"))
    && message.contains(param)
}

pub struct OpenAIProvider {
  client:   reqwest::Client,
  base_url: String,
  api_key:  String,
  model:    String,
  mode:     OpenAIMode
}

impl OpenAIProvider {
  pub fn new(settings: &Settings) -> Result<Self, ProviderError> {
    let api_key = settings.openai_api_key.clone().ok_or_else(|| {
      ProviderError::new(
        NAME,
        ProviderErrorKind::Auth,
        "API key is missing (run `git commitgen config set openai-api-key <key>` or set OPENAI_API_KEY)"
      )
    })?;

    Ok(Self {
      client: http_client(NAME, settings)?,
      base_url: settings.openai_base_url.trim_end_matches('/').to_string(),
      api_key,
      model: settings.model.clone(),
      mode: settings.openai_mode
    })
  }

  fn messages(request: &ProviderRequest, shape: OpenAIMode) -> Vec<Value> {
    request
      .messages
      .iter()
      .map(|message| {
        let role = match message.role {
          Role::System => "system",
          Role::User => "user"
        };
        match shape {
          OpenAIMode::Responses => json!({
            "role": role,
            "content": [{ "type": "input_text", "text": message.content }]
          }),
          _ => json!({ "role": role, "content": message.content })
        }
      })
      .collect()
  }

  /// Request body for `shape`; `token_param` names the output limit field.
  pub fn payload(&self, request: &ProviderRequest, shape: OpenAIMode, temperature: bool, token_param: &str) -> Value {
    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));

    match shape {
      OpenAIMode::Responses => {
        body.insert("input".into(), Value::Array(Self::messages(request, shape)));
        if is_reasoning_model(&request.model) {
          body.insert("reasoning".into(), json!({ "effort": "minimal" }));
          body.insert("text".into(), json!({ "format": { "type": "text" } }));
        }
      }
      _ => {
        body.insert("messages".into(), Value::Array(Self::messages(request, shape)));
      }
    }

    body.insert(token_param.into(), json!(request.max_output_tokens));
    if temperature {
      body.insert("temperature".into(), json!(request.temperature));
    }
    Value::Object(body)
  }

  fn url(&self, shape: OpenAIMode) -> String {
    match shape {
      OpenAIMode::Responses => format!("{}/responses", self.base_url),
      _ => format!("{}/chat/completions", self.base_url)
    }
  }

  async fn post(&self, shape: OpenAIMode, body: &Value) -> Result<Value, ProviderError> {
    let response = self
      .client
      .post(self.url(shape))
      .bearer_auth(&self.api_key)
      .json(body)
      .send()
      .await
      .map_err(|e| self.error(ProviderError::from_reqwest(NAME, &e)))?;

    let status = response.status();
    if status.is_success() {
      return response
        .json::<Value>()
        .await
        .map_err(|e| self.error(ProviderError::new(NAME, ProviderErrorKind::Malformed, format!("invalid response body: {e}"))));
    }

    let delay = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let kind = ProviderErrorKind::from_status(status.as_u16());
    let err = ProviderError::new(NAME, kind, format!("{status}: {}", error_message(&body)))
      .with_retry_after(delay.filter(|_| kind == ProviderErrorKind::RateLimit));
    Err(self.error(err))
  }

  fn error(&self, mut err: ProviderError) -> ProviderError {
    err.message = redact(&err.message, &self.api_key);
    err
  }
}

/// Pulls `code: message` out of an `{"error": {...}}` body, falling back to the raw text.
fn error_message(body: &str) -> String {
  let Ok(json) = serde_json::from_str::<Value>(body) else {
    return body.trim().to_string();
  };

  let error = json.get("error").unwrap_or(&json);
  let message = error
    .get("message")
    .and_then(Value::as_str)
    .or_else(|| error.as_str())
    .unwrap_or_default();

  match error.get("code").and_then(Value::as_str) {
    Some(code) => format!("{code}: {message}"),
    None if message.is_empty() => body.trim().to_string(),
    None => message.to_string()
  }
}

/// Text of a chat completion: `choices[0].message.content`.
pub fn parse_chat(json: &Value) -> Result<String, ProviderError> {
  json
    .get("choices")
    .and_then(|choices| choices.get(0))
    .and_then(|choice| choice.get("message"))
    .and_then(|message| message.get("content"))
    .and_then(Value::as_str)
    .map(String::from)
    .ok_or_else(|| {
      log::debug!("Chat response without content: {json}");
      ProviderError::new(NAME, ProviderErrorKind::Malformed, "response is missing choices[0].message.content")
    })
}

/// Text of a responses API reply: `output_text`, else every `output[].content[].text`.
pub fn parse_responses(json: &Value) -> Result<String, ProviderError> {
  if let Some(text) = json
    .get("output_text")
    .and_then(Value::as_str)
    .filter(|text| !text.trim().is_empty())
  {
    return Ok(text.to_string());
  }

  let Some(output) = json.get("output").and_then(Value::as_array) else {
    log::debug!("Responses reply without output: {json}");
    return Err(ProviderError::new(NAME, ProviderErrorKind::Malformed, "response is missing output text"));
  };

  Ok(
    output
      .iter()
      .filter_map(|item| item.get("content").and_then(Value::as_array))
      .flatten()
      .filter_map(|part| part.get("text").and_then(Value::as_str))
      .collect()
  )
}

#[async_trait]
impl Provider for OpenAIProvider {
  fn name(&self) -> &'static str {
    NAME
  }

  fn model(&self) -> &str {
    &self.model
  }

  async fn complete(&self, _ctx: &ProviderContext, request: &ProviderRequest) -> Result<String, ProviderError> {
    let shape = shape_for(&request.model, self.mode);
    let mut temperature = !is_reasoning_model(&request.model);
    let mut token_param = match shape {
      OpenAIMode::Responses => "max_output_tokens",
      _ => "max_tokens"
    };

    // Each fallback flips one parameter, so this runs at most three times
    loop {
      let body = self.payload(request, shape, temperature, token_param);
      let result = match self.post(shape, &body).await {
        Ok(json) if shape == OpenAIMode::Responses => parse_responses(&json),
        Ok(json) => parse_chat(&json),
        Err(err) => Err(err)
      };

      match result {
        Err(err) if temperature && is_unsupported_param(&err, "temperature") => {
          log::debug!("{} rejected temperature, retrying without it", request.model);
          temperature = false;
        }
        Err(err) if token_param == "max_output_tokens" && is_unsupported_param(&err, "max_output_tokens") => {
          log::debug!("{} rejected max_output_tokens, retrying with max_completion_tokens", request.model);
          token_param = "max_completion_tokens";
        }
        other => return other
      }
    }
  }
}
