//! Structured pipeline events, correlated by a per-run id.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::error::ProviderErrorKind;
use crate::strategy::StrategyKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
  Success,
  /// Failed, another attempt follows after `delay_ms`
  Retry { kind: ProviderErrorKind, delay_ms: u64 },
  /// Failed, no further attempt
  Failure { kind: ProviderErrorKind }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptEvent {
  pub run_id:     Uuid,
  pub provider:   &'static str,
  pub attempt:    u32,
  pub outcome:    AttemptOutcome,
  pub latency_ms: u64
}

impl AttemptEvent {
  pub fn new(run_id: Uuid, provider: &'static str, attempt: u32, outcome: AttemptOutcome, latency: Duration) -> Self {
    Self {
      run_id,
      provider,
      attempt,
      outcome,
      latency_ms: latency.as_millis() as u64
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPhase {
  Started,
  Finished
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
  Attempt(AttemptEvent),
  ModelPull {
    run_id: Uuid,
    model:  String,
    phase:  PullPhase
  },
  Strategy {
    run_id:           Uuid,
    kind:             StrategyKind,
    files:            usize,
    ignored:          usize,
    estimate:         usize,
    max_input_tokens: usize
  },
  Regeneration {
    run_id: Uuid,
    issues: Vec<String>
  }
}

impl PipelineEvent {
  pub fn run_id(&self) -> Uuid {
    match self {
      PipelineEvent::Attempt(attempt) => attempt.run_id,
      PipelineEvent::ModelPull { run_id, .. } | PipelineEvent::Strategy { run_id, .. } | PipelineEvent::Regeneration { run_id, .. } => *run_id
    }
  }
}

/// Receives events as they happen. Implementations must not block.
pub trait EventSink: Send + Sync {
  fn emit(&self, event: PipelineEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
  fn emit(&self, _event: PipelineEvent) {}
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct EventLog {
  events: Mutex<Vec<PipelineEvent>>
}

impl EventLog {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<PipelineEvent> {
    self.events.lock().clone()
  }

  pub fn attempts(&self) -> Vec<AttemptEvent> {
    self
      .events
      .lock()
      .iter()
      .filter_map(|event| match event {
        PipelineEvent::Attempt(attempt) => Some(attempt.clone()),
        _ => None
      })
      .collect()
  }

  pub fn len(&self) -> usize {
    self.events.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.events.lock().is_empty()
  }
}

impl EventSink for EventLog {
  fn emit(&self, event: PipelineEvent) {
    self.events.lock().push(event);
  }
}

/// Forwards events to the `log` facade, as JSON when `json` is set.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink {
  json: bool
}

impl LogSink {
  pub fn new(json: bool) -> Self {
    Self { json }
  }
}

impl EventSink for LogSink {
  fn emit(&self, event: PipelineEvent) {
    if self.json {
      match serde_json::to_string(&event) {
        Ok(line) => log::info!(target: "commitgen::events", "{line}"),
        Err(e) => log::warn!("Failed to serialize event: {e}")
      }
      return;
    }

    match &event {
      PipelineEvent::Attempt(attempt) => match attempt.outcome {
        AttemptOutcome::Success => log::debug!("{} attempt {} succeeded in {}ms", attempt.provider, attempt.attempt, attempt.latency_ms),
        AttemptOutcome::Retry { kind, delay_ms } => {
          log::warn!("{} attempt {} failed ({kind}), retrying in {delay_ms}ms", attempt.provider, attempt.attempt)
        }
        AttemptOutcome::Failure { kind } => log::warn!("{} attempt {} failed ({kind})", attempt.provider, attempt.attempt)
      },
      PipelineEvent::ModelPull { model, phase, .. } => match phase {
        PullPhase::Started => log::info!("Pulling model {model}, this may take a while"),
        PullPhase::Finished => log::info!("Model {model} is ready")
      },
      PipelineEvent::Strategy { kind, files, estimate, max_input_tokens, .. } => {
        log::debug!("Using {kind} prompt for {files} file(s), estimate {estimate}/{max_input_tokens} tokens")
      }
      PipelineEvent::Regeneration { issues, .. } => log::debug!("Regenerating: {}", issues.join(" "))
    }
  }
}
