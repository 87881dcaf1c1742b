mod common;

use std::time::Duration;

use anyhow::Result;
use commitgen::config::{OpenAIMode, ProviderKind};
use commitgen::error::{PipelineError, ProviderErrorKind};
use commitgen::events::{AttemptOutcome, EventLog};
use commitgen::ignore::IgnoreSet;
use commitgen::prompt::Prompt;
use commitgen::provider::retry::RetryPolicy;
use commitgen::provider::{OpenAIProvider, Provider, ProviderContext, ProviderRequest};
use commitgen::{CancelToken, Pipeline, Settings};
use common::raw_files;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const KEY: &str = "sk-test-0123456789";

fn settings(server: &MockServer, model: &str) -> Settings {
  Settings {
    provider: ProviderKind::OpenAI,
    model: model.into(),
    openai_mode: OpenAIMode::Auto,
    openai_base_url: server.uri(),
    openai_api_key: Some(KEY.into()),
    retry: RetryPolicy {
      max_attempts: 3,
      base_delay:   Duration::from_millis(10),
      max_delay:    Duration::from_millis(50),
      jitter:       false
    },
    ..Settings::default()
  }
}

fn request(model: &str) -> ProviderRequest {
  let prompt = Prompt { system: "Write a commit message.".into(), user: "diff --git a/x b/x".into() };
  ProviderRequest::new("openai", model, &prompt, 0.2, 128)
}

fn context(model: &str) -> ProviderContext {
  ProviderContext { model: model.into(), pulled: false }
}

fn chat_reply(text: &str) -> ResponseTemplate {
  ResponseTemplate::new(200).set_body_json(json!({
    "id": "chatcmpl-1",
    "choices": [{ "index": 0, "message": { "role": "assistant", "content": text } }]
  }))
}

fn body(request: &Request) -> Value {
  serde_json::from_slice(&request.body).unwrap()
}

#[tokio::test]
async fn test_chat_completion() -> Result<()> {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/chat/completions"))
    .and(header("authorization", format!("Bearer {KEY}").as_str()))
    .and(body_partial_json(json!({ "model": "gpt-4o-mini", "max_tokens": 128 })))
    .respond_with(chat_reply("feat: add x"))
    .expect(1)
    .mount(&server)
    .await;

  let provider = OpenAIProvider::new(&settings(&server, "gpt-4o-mini"))?;
  let text = provider
    .complete(&context("gpt-4o-mini"), &request("gpt-4o-mini"))
    .await?;
  assert_eq!(text, "feat: add x");

  let received = server.received_requests().await.unwrap();
  let sent = body(&received[0]);
  assert_eq!(sent["messages"][0]["role"], "system");
  assert_eq!(sent["messages"][1]["content"], "diff --git a/x b/x");
  assert!(sent.get("temperature").is_some());
  Ok(())
}

#[tokio::test]
async fn test_reasoning_model_uses_responses_api() -> Result<()> {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/responses"))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({
      "id": "resp_1",
      "output": [
        { "type": "reasoning", "summary": [] },
        { "type": "message", "content": [{ "type": "output_text", "text": "fix: handle empty input" }] }
      ]
    })))
    .expect(1)
    .mount(&server)
    .await;

  let provider = OpenAIProvider::new(&settings(&server, "gpt-5-nano"))?;
  let text = provider
    .complete(&context("gpt-5-nano"), &request("gpt-5-nano"))
    .await?;
  assert_eq!(text, "fix: handle empty input");

  let sent = body(&server.received_requests().await.unwrap()[0]);
  assert!(sent.get("temperature").is_none());
  assert_eq!(sent["max_output_tokens"], 128);
  assert_eq!(sent["reasoning"]["effort"], "minimal");
  Ok(())
}

#[tokio::test]
async fn test_unsupported_temperature_falls_back() -> Result<()> {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/chat/completions"))
    .respond_with(|request: &Request| {
      if body(request).get("temperature").is_some() {
        ResponseTemplate::new(400).set_body_json(json!({
          "error": {
            "message": "Unsupported parameter: 'temperature' is not supported with this model.",
            "type": "invalid_request_error",
            "code": "unsupported_parameter"
          }
        }))
      } else {
        chat_reply("chore: bump deps")
      }
    })
    .expect(2)
    .mount(&server)
    .await;

  let provider = OpenAIProvider::new(&settings(&server, "gpt-4.1-mini"))?;
  let text = provider
    .complete(&context("gpt-4.1-mini"), &request("gpt-4.1-mini"))
    .await?;
  assert_eq!(text, "chore: bump deps");
  Ok(())
}

#[tokio::test]
async fn test_rejected_key_is_auth_and_redacted() -> Result<()> {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/chat/completions"))
    .respond_with(ResponseTemplate::new(401).set_body_json(json!({
      "error": { "message": format!("Incorrect API key provided: {KEY}"), "code": "invalid_api_key" }
    })))
    .mount(&server)
    .await;

  let provider = OpenAIProvider::new(&settings(&server, "gpt-4o-mini"))?;
  let err = provider
    .complete(&context("gpt-4o-mini"), &request("gpt-4o-mini"))
    .await
    .unwrap_err();
  assert_eq!(err.kind, ProviderErrorKind::Auth);
  assert!(!err.message.contains(KEY));
  assert!(!err.to_string().contains(KEY));
  Ok(())
}

#[tokio::test]
async fn test_server_error_is_unavailable() -> Result<()> {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
    .mount(&server)
    .await;

  let provider = OpenAIProvider::new(&settings(&server, "gpt-4o-mini"))?;
  let err = provider
    .complete(&context("gpt-4o-mini"), &request("gpt-4o-mini"))
    .await
    .unwrap_err();
  assert_eq!(err.kind, ProviderErrorKind::Unavailable);
  assert!(err.message.contains("upstream overloaded"));
  Ok(())
}

#[tokio::test]
async fn test_rate_limit_honors_retry_after() -> Result<()> {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/chat/completions"))
    .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
    .up_to_n_times(1)
    .mount(&server)
    .await;
  Mock::given(method("POST"))
    .and(path("/chat/completions"))
    .respond_with(chat_reply("perf: cache parsed configs"))
    .mount(&server)
    .await;

  let settings = settings(&server, "gpt-4o-mini");
  let provider = OpenAIProvider::new(&settings)?;
  let events = EventLog::new();
  let pipeline = Pipeline::new(&settings, &provider, &events)?;

  let message = pipeline
    .run(raw_files(1, 3), &IgnoreSet::empty(), &CancelToken::new())
    .await?;
  assert_eq!(message.text, "perf: cache parsed configs");

  let outcomes: Vec<_> = events.attempts().into_iter().map(|attempt| attempt.outcome).collect();
  assert_eq!(outcomes, vec![
    AttemptOutcome::Retry { kind: ProviderErrorKind::RateLimit, delay_ms: 1000 },
    AttemptOutcome::Success,
  ]);
  Ok(())
}

#[tokio::test]
async fn test_pipeline_surfaces_auth_without_retrying() -> Result<()> {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
    .expect(1)
    .mount(&server)
    .await;

  let settings = settings(&server, "gpt-4o-mini");
  let provider = OpenAIProvider::new(&settings)?;
  let pipeline = Pipeline::new(&settings, &provider, &commitgen::events::NoopSink)?;

  let err = pipeline
    .run(raw_files(1, 3), &IgnoreSet::empty(), &CancelToken::new())
    .await
    .unwrap_err();
  assert!(matches!(err, PipelineError::Provider(ref e) if e.kind == ProviderErrorKind::Auth));
  Ok(())
}
