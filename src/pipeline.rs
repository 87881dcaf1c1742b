//! End-to-end commit message generation for one set of staged changes.
//!
//! `Pipeline::run` builds the diff context, picks a strategy, renders the prompt,
//! dispatches it and finalizes the response. Every failure comes back as a single
//! [`PipelineError`]; a partial message is never returned.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::budget::Estimator;
use crate::config::Settings;
use crate::diff::{DiffContext, RawFileDiff};
use crate::error::PipelineError;
use crate::events::{EventSink, PipelineEvent};
use crate::ignore::IgnoreSet;
use crate::prompt::{Prompt, PromptBuilder};
use crate::provider::retry::Dispatch;
use crate::provider::{Provider, ProviderContext, ProviderRequest};
use crate::sanitize::{salvage, sanitize, validate, ValidationIssue};
use crate::strategy::{self, StrategyKind};
use crate::Profile;

/// Cooperative cancellation shared between the caller and a running pipeline.
#[derive(Debug, Clone)]
pub struct CancelToken {
  sender:   Arc<watch::Sender<bool>>,
  receiver: watch::Receiver<bool>
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}

impl CancelToken {
  pub fn new() -> Self {
    let (sender, receiver) = watch::channel(false);
    Self { sender: Arc::new(sender), receiver }
  }

  pub fn cancel(&self) {
    self.sender.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.receiver.borrow()
  }

  /// Resolves once [`CancelToken::cancel`] has been called on any clone.
  pub async fn cancelled(&self) {
    let mut receiver = self.receiver.clone();
    if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
      // The sender lives inside every clone, so this cannot close while we hold one
      std::future::pending::<()>().await;
    }
  }
}

/// Final outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedMessage {
  pub text:        String,
  /// Whether the text passed validation
  pub validated:   bool,
  /// Whether the text came from the corrective second request
  pub regenerated: bool,
  pub strategy:    StrategyKind,
  pub run_id:      Uuid,
  /// Files the diff limits shrank or left out
  pub warnings:    Vec<String>
}

/// Result of [`finalize`], before the run metadata is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
  pub text:        String,
  pub validated:   bool,
  pub regenerated: bool
}

/// Sanitizes and validates `first`; when invalid, asks `regenerate` once for a
/// corrected message and accepts whatever comes back.
///
/// An empty first response is an error. A failed or empty regeneration falls
/// back to the first response, except for timeouts and cancellation.
pub async fn finalize<F, Fut>(provider: &'static str, first: &str, settings: &Settings, regenerate: F) -> Result<Finalized, PipelineError>
where
  F: FnOnce(Vec<ValidationIssue>) -> Fut,
  Fut: Future<Output = Result<String, PipelineError>>
{
  let text = sanitize(first, settings.one_line);
  if text.is_empty() {
    return Err(PipelineError::EmptyMessage { provider });
  }

  let issues = match validate(&text, settings.conventional) {
    Ok(()) => return Ok(Finalized { text, validated: true, regenerated: false }),
    Err(err) => err.issues
  };

  if let Some(header) = salvage(&sanitize(first, false)) {
    log::debug!("Using valid header found further down the response");
    return Ok(Finalized { text: header, validated: true, regenerated: false });
  }

  log::debug!("Message {text:?} failed validation: {issues:?}");
  let unvalidated = Finalized { text, validated: false, regenerated: false };

  match regenerate(issues).await {
    Ok(second) => {
      let second = sanitize(&second, settings.one_line);
      if second.is_empty() {
        log::warn!("Regenerated message was empty, keeping the first response");
        return Ok(unvalidated);
      }
      let validated = validate(&second, settings.conventional).is_ok();
      Ok(Finalized { text: second, validated, regenerated: true })
    }
    Err(err) if err.is_terminal_control() => Err(err),
    Err(err) => {
      log::warn!("Regeneration failed, keeping the first response: {err}");
      Ok(unvalidated)
    }
  }
}

/// One configured generator. Cheap to build; holds no state between runs.
pub struct Pipeline<'a> {
  settings:  &'a Settings,
  provider:  &'a dyn Provider,
  events:    &'a dyn EventSink,
  estimator: Estimator
}

impl<'a> Pipeline<'a> {
  pub fn new(settings: &'a Settings, provider: &'a dyn Provider, events: &'a dyn EventSink) -> Result<Self, PipelineError> {
    Ok(Self {
      settings,
      provider,
      events,
      estimator: Estimator::for_tokenizer(settings.tokenizer)?
    })
  }

  /// Generates a message for `raw`, honoring the overall deadline and `cancel`.
  pub async fn run(&self, raw: Vec<RawFileDiff>, ignore: &IgnoreSet, cancel: &CancelToken) -> Result<GeneratedMessage, PipelineError> {
    let _profile = Profile::new("Pipeline run");
    let run_id = Uuid::new_v4();
    log::debug!("Starting run {run_id} with {} raw file(s)", raw.len());

    if cancel.is_cancelled() {
      return Err(PipelineError::Cancelled);
    }

    let ctx = DiffContext::build_with_limits(raw, ignore, &self.settings.limits)?;
    let (files, ignored) = (ctx.len(), ctx.ignored());
    let warnings = ctx.warnings().to_vec();
    let (decision, selection) = strategy::select(ctx, self.settings, &self.estimator)?;
    self.events.emit(PipelineEvent::Strategy {
      run_id,
      kind: selection.kind,
      files,
      ignored,
      estimate: selection.full_estimate,
      max_input_tokens: self.settings.budget.max_input_tokens()
    });

    let prompt = PromptBuilder::new(self.settings).build(&decision)?;

    // Model downloads can take minutes and are not part of the generation deadline
    let provider_ctx = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
      prepared = self.provider.prepare(run_id, self.events) => prepared?
    };

    let deadline = self.settings.overall_timeout;
    let work = self.generate(run_id, &prompt, &provider_ctx);

    let finalized = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
      result = tokio::time::timeout(deadline, work) => match result {
        Ok(finalized) => finalized?,
        Err(_) => return Err(PipelineError::Timeout(deadline))
      }
    };

    log::info!(
      "Generated message (validated: {}, regenerated: {})",
      finalized.validated,
      finalized.regenerated
    );

    Ok(GeneratedMessage {
      text: finalized.text,
      validated: finalized.validated,
      regenerated: finalized.regenerated,
      strategy: decision.kind(),
      run_id,
      warnings
    })
  }

  async fn generate(&self, run_id: Uuid, prompt: &Prompt, provider_ctx: &ProviderContext) -> Result<Finalized, PipelineError> {
    let dispatch = Dispatch {
      provider: self.provider,
      policy: self.settings.retry,
      attempt_timeout: self.settings.request_timeout,
      run_id,
      events: self.events
    };

    let request = self.request(prompt, provider_ctx);
    let first = dispatch.send(provider_ctx, &request).await?;

    finalize(self.provider.name(), &first, self.settings, |issues| async move {
      self.events.emit(PipelineEvent::Regeneration {
        run_id,
        issues: issues.iter().map(|issue| issue.describe().to_string()).collect()
      });
      let corrected = self.request(&prompt.corrected(&issues), provider_ctx);
      Ok(dispatch.send(provider_ctx, &corrected).await?)
    })
    .await
  }

  fn request(&self, prompt: &Prompt, provider_ctx: &ProviderContext) -> ProviderRequest {
    ProviderRequest::new(
      self.provider.name(),
      provider_ctx.model.clone(),
      prompt,
      self.settings.temperature,
      self.settings.budget.max_output_tokens()
    )
  }
}
