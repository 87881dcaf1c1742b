//! System and user prompt rendering.
//!
//! Rendering is pure: the same settings and diff body always produce the same
//! text, which keeps budget estimates reproducible.

use std::collections::BTreeMap;

use maplit::btreemap;
use serde::Serialize;

use crate::budget::Estimator;
use crate::config::Settings;
use crate::error::PipelineError;
use crate::sanitize::{ValidationIssue, COMMIT_TYPES, MAX_SUBJECT_CHARS};
use crate::strategy::StrategyDecision;

const SYSTEM_TEMPLATE: &str = r#"You are a Git commit message generator.
{{#conventional}}
TASK: Write a commit message in Conventional Commits format.
FORMAT: <type>(<scope>): <subject>
<type> MUST be one of: {{{types}}}
(<scope>) is optional and should be a short noun.
{{/conventional}}
{{^conventional}}
TASK: Write a concise commit message.
{{/conventional}}
{{#one_line}}
OUTPUT: A single line only. No body.
{{/one_line}}
{{^one_line}}
OUTPUT: A subject line, then optionally a blank line and a short body.
{{/one_line}}
{{#emoji}}
{{#conventional}}
Put the emoji for the change type right after the colon: {{{emoji_table}}}
{{/conventional}}
{{^conventional}}
Start the subject with the emoji for the change type: {{{emoji_table}}}
{{/conventional}}
{{/emoji}}
{{^emoji}}
Do not use emoji.
{{/emoji}}
{{#has_language}}
Write the message in {{{language}}}.
{{/has_language}}
RULES:
- Subject must be imperative, lowercase and at most {{max_subject}} characters.
- Plain text only, no markdown.
- Do not wrap the message in quotes or code fences.
- Respond with the commit message and nothing else."#;

const CORRECTION_HEADER: &str = "Your previous answer was rejected. Follow the required format exactly.";

const FULL_INTRO: &str = "Generate the commit message for this diff:";
const SUMMARY_INTRO: &str =
  "The diff was too large to send in full. Below is a per-file summary of the staged changes.\nGenerate the commit message from this summary:";

#[derive(Serialize)]
struct SystemData<'a> {
  conventional: bool,
  one_line:     bool,
  emoji:        bool,
  has_language: bool,
  language:     &'a str,
  types:        String,
  emoji_table:  String,
  max_subject:  usize
}

/// A rendered request body: one system and one user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
  pub system: String,
  pub user:   String
}

fn emoji_table() -> BTreeMap<&'static str, &'static str> {
  btreemap! {
    "feat" => "✨",
    "fix" => "🐛",
    "build" => "📦",
    "chore" => "🔧",
    "ci" => "👷",
    "docs" => "📝",
    "style" => "🎨",
    "refactor" => "♻️",
    "perf" => "⚡",
    "test" => "✅"
  }
}

pub struct PromptBuilder<'a> {
  settings: &'a Settings
}

impl<'a> PromptBuilder<'a> {
  pub fn new(settings: &'a Settings) -> Self {
    Self { settings }
  }

  /// The fixed instruction describing the output grammar and formatting options.
  pub fn system(&self) -> Result<String, PipelineError> {
    let data = SystemData {
      conventional: self.settings.conventional,
      one_line:     self.settings.one_line,
      emoji:        self.settings.emoji,
      has_language: self.settings.language.is_some(),
      language:     self.settings.language.as_deref().unwrap_or_default(),
      types:        COMMIT_TYPES.join(", "),
      emoji_table:  emoji_table()
        .iter()
        .map(|(kind, emoji)| format!("{kind} {emoji}"))
        .collect::<Vec<_>>()
        .join(", "),
      max_subject:  MAX_SUBJECT_CHARS
    };

    let rendered = mustache::compile_str(SYSTEM_TEMPLATE)?.render_to_string(&data)?;

    // Section tags leave blank lines behind
    Ok(
      rendered
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
    )
  }

  /// User message for the full diff.
  pub fn full_user(&self, diff: &str) -> String {
    format!("{FULL_INTRO}\n\n{diff}")
  }

  /// User message for the reduced summary.
  pub fn summary_user(&self, summary: &str) -> String {
    format!("{SUMMARY_INTRO}\n\n{summary}")
  }

  pub fn build(&self, decision: &StrategyDecision) -> Result<Prompt, PipelineError> {
    let user = match decision {
      StrategyDecision::Full(ctx) => self.full_user(&ctx.render()),
      StrategyDecision::Summarized(summary) => self.summary_user(summary.text())
    };
    Ok(Prompt { system: self.system()?, user })
  }

  /// Tokens of the system message with the longest possible corrective
  /// instruction appended, so a regeneration stays within the same budget.
  pub fn reserved_system(&self, estimator: &Estimator) -> Result<usize, PipelineError> {
    let system = format!("{}\n\n{}", self.system()?, correction(ValidationIssue::ALL));
    Ok(estimator.estimate(&system))
  }

  /// Tokens used by everything except the diff body.
  pub fn overhead(&self, estimator: &Estimator) -> Result<usize, PipelineError> {
    let user = estimator
      .estimate(&self.full_user(""))
      .max(estimator.estimate(&self.summary_user("")));
    Ok(self.reserved_system(estimator)? + user)
  }
}

/// Corrective instruction appended to the system prompt on regeneration.
pub fn correction(issues: &[ValidationIssue]) -> String {
  let mut text = String::from(CORRECTION_HEADER);
  for issue in issues {
    text.push_str("\n- ");
    text.push_str(issue.describe());
  }
  text
}

impl Prompt {
  /// Same prompt with the corrective instruction appended to the system message.
  pub fn corrected(&self, issues: &[ValidationIssue]) -> Prompt {
    Prompt {
      system: format!("{}\n\n{}", self.system, correction(issues)),
      user:   self.user.clone()
    }
  }

  pub fn estimate(&self, estimator: &Estimator) -> usize {
    estimator.estimate_all(&[&self.system, &self.user])
  }
}
