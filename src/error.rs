//! Error types for the commit message pipeline.
//!
//! Every stage returns a `Result` and the orchestrator turns whatever went wrong
//! into a single [`PipelineError`]. Validation failures are deliberately not part
//! of this enum: they only trigger regeneration (see [`crate::sanitize`]).

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Classification of a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
  /// Credential missing or rejected (401/403)
  Auth,
  /// 429 from the backend
  RateLimit,
  /// Timeouts, refused or reset connections
  Network,
  /// Request rejected as invalid, or a response we could not decode
  Malformed,
  /// 5xx and 408 responses
  Unavailable
}

impl ProviderErrorKind {
  /// Whether another attempt can reasonably succeed.
  pub fn is_retriable(&self) -> bool {
    matches!(self, ProviderErrorKind::RateLimit | ProviderErrorKind::Network | ProviderErrorKind::Unavailable)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      ProviderErrorKind::Auth => "auth",
      ProviderErrorKind::RateLimit => "rate limit",
      ProviderErrorKind::Network => "network",
      ProviderErrorKind::Malformed => "malformed",
      ProviderErrorKind::Unavailable => "unavailable"
    }
  }

  /// Maps an HTTP status code onto a kind.
  pub fn from_status(status: u16) -> Self {
    match status {
      401 | 403 => ProviderErrorKind::Auth,
      429 => ProviderErrorKind::RateLimit,
      408 => ProviderErrorKind::Unavailable,
      s if s >= 500 => ProviderErrorKind::Unavailable,
      _ => ProviderErrorKind::Malformed
    }
  }
}

impl fmt::Display for ProviderErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Which provider operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  ModelCheck,
  ModelPull,
  Completion
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Stage::ModelCheck => "model check",
      Stage::ModelPull => "model pull",
      Stage::Completion => "completion"
    })
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{provider} {stage} failed ({kind}): {message}")]
pub struct ProviderError {
  pub provider:    &'static str,
  pub stage:       Stage,
  pub kind:        ProviderErrorKind,
  pub message:     String,
  /// Server supplied delay hint, only set for rate limits
  pub retry_after: Option<Duration>
}

impl ProviderError {
  pub fn new(provider: &'static str, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
    Self {
      provider,
      stage: Stage::Completion,
      kind,
      message: message.into(),
      retry_after: None
    }
  }

  pub fn at(mut self, stage: Stage) -> Self {
    self.stage = stage;
    self
  }

  pub fn with_retry_after(mut self, delay: Option<Duration>) -> Self {
    self.retry_after = delay;
    self
  }

  pub fn is_auth(&self) -> bool {
    self.kind == ProviderErrorKind::Auth
  }

  /// Classifies a transport level failure from reqwest.
  pub fn from_reqwest(provider: &'static str, err: &reqwest::Error) -> Self {
    let kind = if err.is_timeout() || err.is_connect() || err.is_request() {
      ProviderErrorKind::Network
    } else if let Some(status) = err.status() {
      ProviderErrorKind::from_status(status.as_u16())
    } else if err.is_decode() || err.is_body() {
      ProviderErrorKind::Malformed
    } else {
      ProviderErrorKind::Network
    };

    // reqwest includes the URL, never headers, so the credential cannot leak here
    Self::new(provider, kind, err.to_string())
  }
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("no diffable content left after filtering ({ignored} file(s) matched ignore patterns)")]
  Collection { ignored: usize },

  #[error(transparent)]
  Provider(#[from] ProviderError),

  #[error("{provider} returned an empty commit message")]
  EmptyMessage { provider: &'static str },

  #[error("generation did not finish within {0:?}")]
  Timeout(Duration),

  #[error("generation cancelled")]
  Cancelled,

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("failed to render prompt: {0}")]
  Prompt(String)
}

impl PipelineError {
  /// Whether the error ends the run regardless of where it surfaced.
  pub fn is_terminal_control(&self) -> bool {
    matches!(self, PipelineError::Timeout(_) | PipelineError::Cancelled)
  }
}

impl From<mustache::Error> for PipelineError {
  fn from(err: mustache::Error) -> Self {
    PipelineError::Prompt(err.to_string())
  }
}

/// Replaces every occurrence of `secret` in `text`.
///
/// Backends sometimes echo parts of the request back in error bodies.
pub fn redact(text: &str, secret: &str) -> String {
  if secret.len() < 4 {
    return text.to_string();
  }
  text.replace(secret, "***")
}
