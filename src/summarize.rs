//! Per-file summaries for diffs that do not fit the input budget.
//!
//! The map step condenses every file independently on a bounded rayon pool;
//! results land in completion order and the reduce step restores discovery
//! order before concatenating. Summaries are built locally from the diff, so
//! the same input always yields the same text.

use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::budget::Estimator;
use crate::diff::{DiffContext, FileDiff};
use crate::profile;

/// Smallest per-file allowance; below this a summary is just a truncated headline.
pub const MIN_FILE_TOKENS: usize = 64;

const SEPARATOR: &str = "\n\n";

/// Condensed description of one file, tagged with its position in the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
  pub index: usize,
  pub path:  String,
  pub text:  String
}

/// Result of the reduce step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reduced {
  pub text:     String,
  pub included: usize,
  pub omitted:  usize
}

/// Reduced prompt body, with the context it was built from.
#[derive(Debug, Clone)]
pub struct SummarizedContext {
  source:  DiffContext,
  reduced: Reduced
}

impl SummarizedContext {
  pub fn text(&self) -> &str {
    &self.reduced.text
  }

  pub fn source(&self) -> &DiffContext {
    &self.source
  }

  /// Number of file summaries dropped to fit the budget.
  pub fn omitted(&self) -> usize {
    self.reduced.omitted
  }

  pub fn included(&self) -> usize {
    self.reduced.included
  }
}

/// Tokens each file may use when `available` is shared by `files` summaries.
pub fn per_file_budget(available: usize, files: usize) -> usize {
  let files = files.max(1);
  // One token per separator between summaries
  (available.saturating_sub(files - 1) / files).max(MIN_FILE_TOKENS)
}

fn omission_line(count: usize) -> String {
  format!("... {count} more changed line(s)")
}

fn truncation_marker(count: usize) -> String {
  format!("[{count} earlier file summary(ies) omitted to fit the token budget]")
}

/// Condenses one file to at most `budget` tokens.
///
/// A file that fits is kept verbatim. Otherwise the headline is followed by as
/// many changed lines as fit, then a count of what was left out.
pub fn summarize_file(file: &FileDiff, budget: usize, estimator: &Estimator) -> String {
  let rendered = file.render();
  if estimator.estimate(&rendered) <= budget {
    return rendered;
  }

  let headline = file.headline();
  let mut used = estimator.estimate(&headline);
  if used >= budget {
    return estimator.truncate(&headline, budget);
  }

  let lines = file.condensed_lines();
  // Estimates are subadditive, so summing per-line costs never undercounts
  let costs: Vec<usize> = lines.iter().map(|line| estimator.estimate(line) + 1).collect();
  let reserve = estimator.estimate(&omission_line(lines.len())) + 1;

  let mut out = headline;
  let mut kept = lines.len();
  if used + costs.iter().sum::<usize>() > budget {
    kept = 0;
    for cost in &costs {
      if used + cost + reserve > budget {
        break;
      }
      used += cost;
      kept += 1;
    }
  }

  for line in &lines[..kept] {
    out.push('\n');
    out.push_str(line);
  }
  if kept < lines.len() {
    out.push('\n');
    out.push_str(&omission_line(lines.len() - kept));
  }

  if estimator.estimate(&out) > budget {
    return estimator.truncate(&out, budget);
  }
  out
}

/// Orders summaries by discovery index and joins them, dropping the earliest
/// ones until the result fits `available`. A marker records how many were dropped.
pub fn reduce(mut summaries: Vec<FileSummary>, available: usize, estimator: &Estimator) -> Reduced {
  summaries.sort_by_key(|summary| summary.index);
  let total = summaries.len();

  let join = |parts: &[FileSummary]| {
    parts
      .iter()
      .map(|summary| summary.text.as_str())
      .collect::<Vec<_>>()
      .join(SEPARATOR)
  };

  let text = join(&summaries);
  if estimator.estimate(&text) <= available {
    return Reduced { text, included: total, omitted: 0 };
  }

  // Upper bound per kept summary, separator included
  let costs: Vec<usize> = summaries
    .iter()
    .map(|summary| estimator.estimate(&summary.text) + 1)
    .collect();
  let mut suffix = costs.iter().sum::<usize>();

  for skip in 1..=total {
    suffix -= costs[skip - 1];
    let marker = truncation_marker(skip);
    if suffix + estimator.estimate(&marker) > available {
      continue;
    }

    let kept = &summaries[skip..];
    let text = if kept.is_empty() { marker } else { format!("{}{SEPARATOR}{marker}", join(kept)) };
    if estimator.estimate(&text) <= available {
      log::warn!("Dropped {skip} of {total} file summaries to fit {available} tokens");
      return Reduced { text, included: total - skip, omitted: skip };
    }
  }

  let text = estimator.truncate(&truncation_marker(total), available);
  Reduced { text, included: 0, omitted: total }
}

/// Bounded parallel map over the files of a context.
pub struct Summarizer<'a> {
  estimator:   &'a Estimator,
  concurrency: usize
}

impl<'a> Summarizer<'a> {
  pub fn new(estimator: &'a Estimator, concurrency: usize) -> Self {
    Self { estimator, concurrency: concurrency.clamp(1, num_cpus::get().max(1)) }
  }

  /// Summaries in completion order.
  pub fn map(&self, ctx: &DiffContext, per_file: usize) -> Vec<FileSummary> {
    profile!("Summarize files");
    let results = Arc::new(Mutex::new(Vec::with_capacity(ctx.len())));

    let work = |(index, file): (usize, &FileDiff)| {
      let text = summarize_file(file, per_file, self.estimator);
      results.lock().push(FileSummary { index, path: file.path().to_string(), text });
    };

    match rayon::ThreadPoolBuilder::new()
      .num_threads(self.concurrency)
      .build()
    {
      Ok(pool) => pool.install(|| ctx.files().par_iter().enumerate().for_each(work)),
      Err(e) => {
        log::warn!("Failed to start summary workers, summarizing sequentially: {e}");
        ctx.files().iter().enumerate().for_each(work);
      }
    }

    let mut results = results.lock();
    std::mem::take(&mut *results)
  }

  /// Map then reduce so the result fits in `available` tokens.
  pub fn summarize(&self, ctx: DiffContext, available: usize) -> SummarizedContext {
    let per_file = per_file_budget(available, ctx.len());
    log::debug!(
      "Summarizing {} file(s) at {per_file} tokens each with {} worker(s)",
      ctx.len(),
      self.concurrency
    );

    let summaries = self.map(&ctx, per_file);
    let reduced = reduce(summaries, available, self.estimator);
    SummarizedContext { source: ctx, reduced }
  }
}
