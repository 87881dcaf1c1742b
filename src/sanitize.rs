//! Response cleanup and commit grammar checks.

use std::fmt;

use once_cell::sync::Lazy;
use regex_lite::Regex;

pub const COMMIT_TYPES: &[&str] = &["feat", "fix", "build", "chore", "ci", "docs", "style", "refactor", "perf", "test"];
pub const MAX_SUBJECT_CHARS: usize = 50;

static HEADER: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^(?P<type>[A-Za-z]+)(?:\((?P<scope>[^()]*)\))?(?P<breaking>!)?: (?P<subject>.*)$").expect("valid header pattern"));

// Words ending in -ed/-ing that are already imperative
const IMPERATIVE_EXCEPTIONS: &[&str] = &[
  "embed", "exceed", "proceed", "succeed", "need", "feed", "seed", "speed", "shed", "bleed", "breed", "heed", "bring", "string", "ping",
  "sing", "spring", "swing", "ring", "wing"
];

const QUOTE_PAIRS: &[(char, char)] = &[('"', '"'), ('\'', '\''), ('`', '`'), ('“', '”'), ('‘', '’')];

/// A single reason a message was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationIssue {
  Empty,
  MissingType,
  UnknownType,
  EmptyScope,
  EmptySubject,
  UppercaseSubject,
  SubjectTooLong,
  NotImperative
}

impl ValidationIssue {
  pub const ALL: &'static [ValidationIssue] = &[
    ValidationIssue::Empty,
    ValidationIssue::MissingType,
    ValidationIssue::UnknownType,
    ValidationIssue::EmptyScope,
    ValidationIssue::EmptySubject,
    ValidationIssue::UppercaseSubject,
    ValidationIssue::SubjectTooLong,
    ValidationIssue::NotImperative
  ];

  /// Instruction shown to the model when asking for a corrected message.
  pub fn describe(&self) -> &'static str {
    match self {
      ValidationIssue::Empty => "The message must not be empty.",
      ValidationIssue::MissingType => "The first line must look like <type>(<scope>): <subject>.",
      ValidationIssue::UnknownType => "The type must be one of feat, fix, build, chore, ci, docs, style, refactor, perf, test.",
      ValidationIssue::EmptyScope => "The scope, when present, must not be empty.",
      ValidationIssue::EmptySubject => "The subject after the colon must not be empty.",
      ValidationIssue::UppercaseSubject => "The subject must start with a lowercase letter.",
      ValidationIssue::SubjectTooLong => "The subject must be at most 50 characters.",
      ValidationIssue::NotImperative => "The subject must use the imperative mood (\"add\", not \"added\" or \"adding\")."
    }
  }
}

impl fmt::Display for ValidationIssue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.describe())
  }
}

/// Non-fatal rejection of a generated message. Only ever triggers regeneration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
  pub issues: Vec<ValidationIssue>
}

impl fmt::Display for ValidationError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let reasons: Vec<_> = self.issues.iter().map(ValidationIssue::describe).collect();
    write!(f, "invalid commit message: {}", reasons.join(" "))
  }
}

impl std::error::Error for ValidationError {}

fn strip_fence(text: &str) -> Option<&str> {
  let rest = text.strip_prefix("```")?;
  let inner = rest.strip_suffix("```").unwrap_or(rest);

  // Drop the info string ("```text") when the fence spans several lines
  match inner.split_once('\n') {
    Some((info, body)) if is_language_tag(info.trim()) => Some(body),
    _ => Some(inner)
  }
}

fn is_language_tag(info: &str) -> bool {
  info
    .chars()
    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-' | '.'))
}

fn strip_quotes(text: &str) -> Option<&str> {
  QUOTE_PAIRS.iter().find_map(|&(open, close)| {
    let inner = text.strip_prefix(open)?.strip_suffix(close)?;
    (!inner.is_empty()).then_some(inner)
  })
}

fn sanitize_pass(text: &str, one_line: bool) -> String {
  let mut text = text.trim();
  if let Some(inner) = strip_fence(text) {
    text = inner.trim();
  } else if let Some(inner) = strip_quotes(text) {
    text = inner.trim();
  }

  if one_line {
    text
      .lines()
      .map(str::trim)
      .find(|line| !line.is_empty())
      .unwrap_or_default()
      .to_string()
  } else {
    text
      .lines()
      .map(str::trim_end)
      .collect::<Vec<_>>()
      .join("\n")
  }
}

/// Trims the raw response, removes a wrapping code fence or quotes and, in
/// single-line mode, keeps the first non-empty line. Idempotent.
///
/// Passes repeat until the text stops changing. A pass never adds characters,
/// so the loop ends.
pub fn sanitize(raw: &str, one_line: bool) -> String {
  let mut current = sanitize_pass(raw, one_line);
  loop {
    let next = sanitize_pass(&current, one_line);
    if next == current {
      return current;
    }
    current = next;
  }
}

fn first_word(subject: &str) -> &str {
  subject
    .trim_start_matches(|c: char| !c.is_alphanumeric())
    .split(|c: char| !c.is_alphanumeric())
    .next()
    .unwrap_or_default()
}

fn is_imperative(word: &str) -> bool {
  let word = word.to_lowercase();
  if word.chars().count() <= 4 || IMPERATIVE_EXCEPTIONS.contains(&word.as_str()) {
    return true;
  }
  !(word.ends_with("ed") || word.ends_with("ing"))
}

/// Checks one header line against `<type>(<scope>)?!?: <subject>`.
pub fn validate_header(header: &str) -> Result<(), ValidationError> {
  if header.trim().is_empty() {
    return Err(ValidationError { issues: vec![ValidationIssue::Empty] });
  }
  let header = header.trim_start();

  let Some(caps) = HEADER.captures(header) else {
    return Err(ValidationError { issues: vec![ValidationIssue::MissingType] });
  };

  let mut issues = Vec::new();
  let kind = caps.name("type").map_or("", |m| m.as_str());
  if !COMMIT_TYPES.contains(&kind) {
    issues.push(ValidationIssue::UnknownType);
  }

  if caps.name("scope").is_some_and(|scope| scope.as_str().trim().is_empty()) {
    issues.push(ValidationIssue::EmptyScope);
  }

  let subject = caps.name("subject").map_or("", |m| m.as_str()).trim();
  if subject.is_empty() {
    issues.push(ValidationIssue::EmptySubject);
  } else {
    if subject.chars().next().is_some_and(char::is_uppercase) {
      issues.push(ValidationIssue::UppercaseSubject);
    }
    if subject.chars().count() > MAX_SUBJECT_CHARS {
      issues.push(ValidationIssue::SubjectTooLong);
    }
    if !is_imperative(first_word(subject)) {
      issues.push(ValidationIssue::NotImperative);
    }
  }

  if issues.is_empty() {
    Ok(())
  } else {
    Err(ValidationError { issues })
  }
}

/// Validates a sanitized message. Only the first line is checked; a body is free-form.
pub fn validate(message: &str, conventional: bool) -> Result<(), ValidationError> {
  let header = message.lines().next().unwrap_or_default();
  if conventional {
    validate_header(header)
  } else if header.trim().is_empty() {
    Err(ValidationError { issues: vec![ValidationIssue::Empty] })
  } else {
    Ok(())
  }
}

/// Finds a valid header further down a chatty response, e.g. after
/// "Here is your commit message:". Returns it as a single-line message.
pub fn salvage(message: &str) -> Option<String> {
  message
    .lines()
    .skip(1)
    .map(str::trim)
    .find(|line| validate_header(line).is_ok())
    .map(String::from)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_accepts_conventional_headers() {
    assert!(validate("feat(cli): add interactive staging", true).is_ok());
    assert!(validate("fix: correct session leak", true).is_ok());
    assert!(validate("refactor(core)!: drop legacy api", true).is_ok());
    assert!(validate("chore(deps): bump tokio to 1.40", true).is_ok());
    assert!(validate("feat: embed version in binary", true).is_ok());
    assert!(validate("feat: bring back dark mode\n\nlonger body Text.", true).is_ok());
  }

  #[test]
  fn test_rejects_invalid_headers() {
    assert_eq!(validate("Fixed bug", true).unwrap_err().issues, vec![ValidationIssue::MissingType]);
    assert_eq!(validate("", true).unwrap_err().issues, vec![ValidationIssue::Empty]);

    let issues = |msg: &str| validate(msg, true).unwrap_err().issues;
    assert_eq!(issues("feature: add thing"), vec![ValidationIssue::UnknownType]);
    assert_eq!(issues("feat(): add thing"), vec![ValidationIssue::EmptyScope]);
    assert_eq!(issues("feat: "), vec![ValidationIssue::EmptySubject]);
    assert_eq!(issues("feat: Add thing"), vec![ValidationIssue::UppercaseSubject]);
    assert_eq!(issues("fix: fixed the login redirect"), vec![ValidationIssue::NotImperative]);
    assert_eq!(issues("feat: adding retries"), vec![ValidationIssue::NotImperative]);
    assert_eq!(issues(&format!("feat: {}", "a".repeat(51))), vec![ValidationIssue::SubjectTooLong]);
    assert!(validate("feat((cli)): add", true).is_err());
  }

  #[test]
  fn test_subject_length_limit_is_inclusive() {
    assert!(validate(&format!("feat: {}", "a".repeat(50)), true).is_ok());
  }

  #[test]
  fn test_free_form_mode_only_requires_text() {
    assert!(validate("Fixed the bug", false).is_ok());
    assert!(validate("   ", false).is_err());
  }

  #[test]
  fn test_sanitize_strips_fences() {
    assert_eq!(sanitize("```\nfix: correct session leak\n```", true), "fix: correct session leak");
    assert_eq!(sanitize("```text\nfix: correct session leak\n```", true), "fix: correct session leak");
    assert_eq!(sanitize("```fix: correct session leak```", true), "fix: correct session leak");
    assert_eq!(sanitize("```rust-lang\nfix: x\n```", true), "fix: x");
  }

  #[test]
  fn test_fenced_message_line_is_not_taken_for_info_string() {
    assert_eq!(sanitize("```feat:add-x\nbody line```", false), "feat:add-x\nbody line");
    assert_eq!(sanitize("```fix(api):x\n```", true), "fix(api):x");
  }

  #[test]
  fn test_deeply_nested_quotes_are_fully_removed() {
    let raw = format!("{}fix: x{}", "\"".repeat(12), "\"".repeat(12));
    let once = sanitize(&raw, true);
    assert_eq!(once, "fix: x");
    assert_eq!(sanitize(&once, true), once);

    let mixed = format!("{}feat: add y{}", "'\"".repeat(10), "\"'".repeat(10));
    assert_eq!(sanitize(&mixed, false), "feat: add y");
  }

  #[test]
  fn test_sanitize_strips_quotes() {
    assert_eq!(sanitize("\"feat: add x\"", true), "feat: add x");
    assert_eq!(sanitize("  'feat: add x'  ", true), "feat: add x");
    assert_eq!(sanitize("“feat: add x”", true), "feat: add x");
    assert_eq!(sanitize("`feat: add x`", true), "feat: add x");
  }

  #[test]
  fn test_single_line_mode_keeps_first_line() {
    assert_eq!(sanitize("\n\nfeat: add x\n\nbody here", true), "feat: add x");
    assert_eq!(sanitize("feat: add x\n\nbody here  \n", false), "feat: add x\n\nbody here");
  }

  #[test]
  fn test_sanitize_is_idempotent() {
    let inputs = [
      "```\n\"fix: correct session leak\"\n```",
      "  feat: add x  ",
      "'''nested'''",
      "```md\n# Title\n\nbody\n```",
      "\"\"",
      ""
    ];
    for input in inputs {
      for one_line in [true, false] {
        let once = sanitize(input, one_line);
        assert_eq!(sanitize(&once, one_line), once, "input {input:?}");
      }
    }
  }

  #[test]
  fn test_salvage_finds_valid_header() {
    let chatty = "Here is your commit message:\nfeat(api): add pagination\nHope this helps";
    assert_eq!(salvage(chatty).as_deref(), Some("feat(api): add pagination"));
    assert_eq!(salvage("Fixed bug\nstill nothing"), None);
  }
}
