//! Full versus summarized prompt selection.

use std::fmt;

use serde::Serialize;

use crate::budget::{Estimator, TokenBudget};
use crate::config::Settings;
use crate::diff::DiffContext;
use crate::error::PipelineError;
use crate::prompt::PromptBuilder;
use crate::summarize::{SummarizedContext, Summarizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
  Full,
  Summarized
}

impl fmt::Display for StrategyKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      StrategyKind::Full => "full",
      StrategyKind::Summarized => "summarized"
    })
  }
}

/// What the prompt will be built from.
#[derive(Debug, Clone)]
pub enum StrategyDecision {
  Full(DiffContext),
  Summarized(SummarizedContext)
}

impl StrategyDecision {
  pub fn kind(&self) -> StrategyKind {
    match self {
      StrategyDecision::Full(_) => StrategyKind::Full,
      StrategyDecision::Summarized(_) => StrategyKind::Summarized
    }
  }
}

/// The selection rule on its own. A prompt whose estimate equals the limit is sent in full.
pub fn choose(full_estimate: usize, budget: &TokenBudget) -> StrategyKind {
  if budget.fits(full_estimate) {
    StrategyKind::Full
  } else {
    StrategyKind::Summarized
  }
}

/// Estimate and budget behind a decision, reported as a pipeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
  pub kind:          StrategyKind,
  pub full_estimate: usize,
  pub available:     usize
}

/// Estimates the Full prompt for `ctx` and summarizes when it does not fit.
pub fn select(ctx: DiffContext, settings: &Settings, estimator: &Estimator) -> Result<(StrategyDecision, Selection), PipelineError> {
  crate::profile!("Select strategy");
  let prompts = PromptBuilder::new(settings);
  let overhead = prompts.overhead(estimator)?;
  let max_input = settings.budget.max_input_tokens();

  if overhead >= max_input {
    return Err(PipelineError::Config(format!(
      "max_input_tokens ({max_input}) leaves no room for the diff after the {overhead} token prompt"
    )));
  }

  let full_estimate = prompts.reserved_system(estimator)? + estimator.estimate(&prompts.full_user(&ctx.render()));
  let available = max_input - overhead;
  let kind = choose(full_estimate, &settings.budget);

  log::info!(
    "Strategy {kind}: {} file(s), estimate {full_estimate} of {max_input} tokens",
    ctx.len()
  );

  let selection = Selection { kind, full_estimate, available };
  let decision = match kind {
    StrategyKind::Full => StrategyDecision::Full(ctx),
    StrategyKind::Summarized => {
      let summarizer = Summarizer::new(estimator, settings.summary_concurrency);
      StrategyDecision::Summarized(summarizer.summarize(ctx, available))
    }
  };

  Ok((decision, selection))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::diff::{ChangeKind, DiffLine, Hunk, RawFileDiff};
  use crate::ignore::IgnoreSet;

  fn context(files: usize, lines_per_file: usize) -> DiffContext {
    let raw = (0..files)
      .map(|i| {
        let lines = (0..lines_per_file)
          .map(|n| DiffLine::added(format!("let value_{n} = compute_something({n}, \"file {i}\");")))
          .collect();
        RawFileDiff::new(format!("src/module_{i}.rs"), ChangeKind::Modified, vec![Hunk::new("@@ -1,0 +1,40 @@", lines)])
      })
      .collect();
    DiffContext::build(raw, &IgnoreSet::empty()).unwrap()
  }

  #[test]
  fn test_choose_is_inclusive() {
    let budget = TokenBudget::new(100, 10).unwrap();
    assert_eq!(choose(99, &budget), StrategyKind::Full);
    assert_eq!(choose(100, &budget), StrategyKind::Full);
    assert_eq!(choose(101, &budget), StrategyKind::Summarized);
  }

  #[test]
  fn test_small_diff_is_sent_in_full() {
    let settings = Settings::default();
    let (decision, selection) = select(context(1, 5), &settings, &Estimator::Heuristic).unwrap();
    assert_eq!(decision.kind(), StrategyKind::Full);
    assert!(selection.full_estimate <= 6000);
  }

  #[test]
  fn test_large_diff_is_summarized_within_budget() {
    let settings = Settings::default();
    let est = Estimator::Heuristic;
    let (decision, selection) = select(context(50, 80), &settings, &est).unwrap();
    assert_eq!(selection.kind, StrategyKind::Summarized);
    assert!(selection.full_estimate > 6000);
    let StrategyDecision::Summarized(summary) = decision else { panic!("expected a summary") };
    assert!(est.estimate(summary.text()) <= selection.available);
  }

  #[test]
  fn test_budget_smaller_than_prompt_is_config_error() {
    let settings = Settings {
      budget: TokenBudget::new(10, 10).unwrap(),
      ..Settings::default()
    };
    assert!(matches!(select(context(1, 1), &settings, &Estimator::Heuristic), Err(PipelineError::Config(_))));
  }
}
