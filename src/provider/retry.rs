//! Attempt bookkeeping and backoff for provider calls.
//!
//! [`AttemptMachine`] owns the state of one dispatch; [`Dispatch::send`] drives
//! it against a provider, sleeping between attempts and reporting each one.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Provider, ProviderContext, ProviderRequest};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::events::{AttemptEvent, AttemptOutcome, EventSink, PipelineEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay:   Duration,
  pub max_delay:    Duration,
  pub jitter:       bool
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay:   Duration::from_millis(200),
      max_delay:    Duration::from_millis(2000),
      jitter:       true
    }
  }
}

impl RetryPolicy {
  /// `min(base * 2^retry, max)`, where `retry` counts from zero.
  pub fn backoff(&self, retry: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Delay before the next attempt, honoring a server supplied hint.
  pub fn delay(&self, retry: u32, err: &ProviderError) -> Duration {
    if let Some(hint) = err.retry_after {
      return hint;
    }

    let delay = self.backoff(retry);
    if !self.jitter || self.base_delay.is_zero() {
      return delay;
    }

    let base_ms = self.base_delay.as_millis() as u64;
    delay + Duration::from_millis(rand::rng().random_range(0..=base_ms))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
  Idle,
  Sending { attempt: u32 },
  Retrying { attempt: u32, delay: Duration },
  Succeeded { attempt: u32 },
  Failed { attempt: u32, kind: ProviderErrorKind }
}

/// Explicit retry state for one dispatch.
///
/// `Idle -> Sending -> (Succeeded | Retrying -> Sending ... | Failed)`.
#[derive(Debug, Clone)]
pub struct AttemptMachine {
  policy: RetryPolicy,
  state:  AttemptState
}

impl AttemptMachine {
  pub fn new(policy: RetryPolicy) -> Self {
    Self { policy, state: AttemptState::Idle }
  }

  pub fn state(&self) -> AttemptState {
    self.state
  }

  pub fn is_done(&self) -> bool {
    matches!(self.state, AttemptState::Succeeded { .. } | AttemptState::Failed { .. })
  }

  /// Moves to `Sending` and returns the 1-based attempt number.
  pub fn start(&mut self) -> u32 {
    let attempt = match self.state {
      AttemptState::Idle => 1,
      AttemptState::Retrying { attempt, .. } => attempt + 1,
      AttemptState::Sending { attempt } | AttemptState::Succeeded { attempt } | AttemptState::Failed { attempt, .. } => {
        log::warn!("Attempt started from state {:?}", self.state);
        attempt + 1
      }
    };
    self.state = AttemptState::Sending { attempt };
    attempt
  }

  pub fn succeed(&mut self) {
    if let AttemptState::Sending { attempt } = self.state {
      self.state = AttemptState::Succeeded { attempt };
    }
  }

  /// Records a failed attempt. Returns the delay before the next one, or `None`
  /// when the error is final or the attempts are used up.
  pub fn fail(&mut self, err: &ProviderError) -> Option<Duration> {
    let attempt = match self.state {
      AttemptState::Sending { attempt } => attempt,
      _ => return None
    };

    if err.kind.is_retriable() && attempt < self.policy.max_attempts {
      let delay = self.policy.delay(attempt - 1, err);
      self.state = AttemptState::Retrying { attempt, delay };
      Some(delay)
    } else {
      self.state = AttemptState::Failed { attempt, kind: err.kind };
      None
    }
  }
}

/// Sends one request with retries, emitting an [`AttemptEvent`] per attempt.
pub struct Dispatch<'a> {
  pub provider:        &'a dyn Provider,
  pub policy:          RetryPolicy,
  pub attempt_timeout: Duration,
  pub run_id:          Uuid,
  pub events:          &'a dyn EventSink
}

impl Dispatch<'_> {
  pub async fn send(&self, ctx: &ProviderContext, request: &ProviderRequest) -> Result<String, ProviderError> {
    let name = self.provider.name();
    let mut machine = AttemptMachine::new(self.policy);

    loop {
      let attempt = machine.start();
      let started = Instant::now();

      let result = match tokio::time::timeout(self.attempt_timeout, self.provider.complete(ctx, request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::new(
          name,
          ProviderErrorKind::Network,
          format!("request timed out after {:?}", self.attempt_timeout)
        ))
      };
      let latency = started.elapsed();

      match result {
        Ok(text) => {
          machine.succeed();
          self.emit(attempt, AttemptOutcome::Success, latency);
          return Ok(text);
        }
        Err(err) => match machine.fail(&err) {
          Some(delay) => {
            log::debug!("Attempt {attempt} against {name} failed: {err}");
            self.emit(
              attempt,
              AttemptOutcome::Retry { kind: err.kind, delay_ms: delay.as_millis() as u64 },
              latency
            );
            tokio::time::sleep(delay).await;
          }
          None => {
            self.emit(attempt, AttemptOutcome::Failure { kind: err.kind }, latency);
            return Err(err);
          }
        }
      }
    }
  }

  fn emit(&self, attempt: u32, outcome: AttemptOutcome, latency: Duration) {
    self
      .events
      .emit(PipelineEvent::Attempt(AttemptEvent::new(self.run_id, self.provider.name(), attempt, outcome, latency)));
  }
}
