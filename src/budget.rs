//! Token budget and prompt size estimation.
//!
//! The default estimator approximates one token per four characters. It never
//! looks at the model and is strictly monotonic in character count, which keeps
//! the Full/Summarized decision reproducible. `cl100k` swaps in the real BPE used
//! by OpenAI chat models for users that want tighter packing.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use tiktoken_rs::CoreBPE;

use crate::error::PipelineError;

const CHARS_PER_TOKEN: usize = 4;

/// Input and output ceilings for a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
  max_input_tokens:  usize,
  max_output_tokens: usize
}

impl TokenBudget {
  pub fn new(max_input_tokens: usize, max_output_tokens: usize) -> Result<Self, PipelineError> {
    if max_input_tokens == 0 {
      return Err(PipelineError::Config("max_input_tokens must be greater than zero".into()));
    }
    if max_output_tokens == 0 {
      return Err(PipelineError::Config("max_output_tokens must be greater than zero".into()));
    }
    Ok(Self { max_input_tokens, max_output_tokens })
  }

  pub fn max_input_tokens(&self) -> usize {
    self.max_input_tokens
  }

  pub fn max_output_tokens(&self) -> usize {
    self.max_output_tokens
  }

  /// Inclusive: an estimate equal to the limit fits.
  pub fn fits(&self, estimate: usize) -> bool {
    estimate <= self.max_input_tokens
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tokenizer {
  Heuristic,
  Cl100k
}

impl FromStr for Tokenizer {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_lowercase().as_str() {
      "heuristic" | "chars" => Ok(Tokenizer::Heuristic),
      "cl100k" | "tiktoken" => Ok(Tokenizer::Cl100k),
      other => bail!("Unknown tokenizer: {}", other)
    }
  }
}

impl fmt::Display for Tokenizer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Tokenizer::Heuristic => "heuristic",
      Tokenizer::Cl100k => "cl100k"
    })
  }
}

/// Counts tokens for prompt text. Cheap to clone.
#[derive(Clone)]
pub enum Estimator {
  Heuristic,
  Bpe(Arc<CoreBPE>)
}

impl fmt::Debug for Estimator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Estimator::Heuristic => f.write_str("Estimator::Heuristic"),
      Estimator::Bpe(_) => f.write_str("Estimator::Bpe(cl100k)")
    }
  }
}

impl Estimator {
  pub fn for_tokenizer(tokenizer: Tokenizer) -> Result<Self, PipelineError> {
    match tokenizer {
      Tokenizer::Heuristic => Ok(Estimator::Heuristic),
      Tokenizer::Cl100k => {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| PipelineError::Config(format!("failed to load cl100k tokenizer: {e}")))?;
        Ok(Estimator::Bpe(Arc::new(bpe)))
      }
    }
  }

  /// Estimated token count of `text`.
  pub fn estimate(&self, text: &str) -> usize {
    if text.is_empty() {
      return 0;
    }

    match self {
      Estimator::Heuristic => text.chars().count().div_ceil(CHARS_PER_TOKEN),
      Estimator::Bpe(bpe) => bpe.encode_with_special_tokens(text).len()
    }
  }

  /// Sum of several estimates, e.g. system plus user message.
  pub fn estimate_all(&self, parts: &[&str]) -> usize {
    parts.iter().map(|part| self.estimate(part)).sum()
  }

  /// Longest prefix of `text` whose estimate fits in `max_tokens`, cut on a char boundary.
  pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
    if self.estimate(text) <= max_tokens {
      return text.to_string();
    }

    let boundaries: Vec<usize> = text
      .char_indices()
      .map(|(i, _)| i)
      .chain(std::iter::once(text.len()))
      .collect();

    // Binary search over char boundaries; estimate is monotonic for the heuristic
    // and close enough for BPE that the final check below keeps us honest
    let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
    while lo < hi {
      let mid = (lo + hi).div_ceil(2);
      if self.estimate(&text[..boundaries[mid]]) <= max_tokens {
        lo = mid;
      } else {
        hi = mid - 1;
      }
    }

    let mut cut = lo;
    while cut > 0 && self.estimate(&text[..boundaries[cut]]) > max_tokens {
      cut -= 1;
    }
    text[..boundaries[cut]].to_string()
  }
}
