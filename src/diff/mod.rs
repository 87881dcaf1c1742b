//! Diff records and the per-run diff context.
//!
//! Raw records come from outside the pipeline (libgit2 in [`crate::git`], or
//! [`parse_patch`] for textual diffs). [`DiffContext::build`] filters and
//! normalizes them once; nothing mutates the context afterwards.

pub mod parser;

use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::ignore::IgnoreSet;

pub use parser::parse_patch;

const BINARY_PLACEHOLDER: &str = "Binary file changed (content omitted)";
const EMPTY_PLACEHOLDER: &str = "No textual content";
const TRUNCATED_MARKER: &str = "... diff truncated due to size";

/// Per-file size caps applied while building a [`DiffContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffLimits {
  /// Files beyond this many are left out of the prompt
  pub max_files:      usize,
  /// Files with more changed lines are reduced to a one line note
  pub max_file_lines: usize,
  /// Rendered diff bytes kept per file
  pub max_file_bytes: usize
}

impl Default for DiffLimits {
  fn default() -> Self {
    Self {
      max_files:      100,
      max_file_lines: 2000,
      max_file_bytes: 200_000
    }
  }
}

/// How a file was shrunk to fit [`DiffLimits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCap {
  /// Content replaced by a one line note
  Omitted,
  /// Content cut after the line or byte cap
  Truncated
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
  Added,
  Modified,
  Deleted,
  Renamed,
  Binary
}

impl ChangeKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ChangeKind::Added => "added",
      ChangeKind::Modified => "modified",
      ChangeKind::Deleted => "deleted",
      ChangeKind::Renamed => "renamed",
      ChangeKind::Binary => "binary"
    }
  }
}

impl fmt::Display for ChangeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineKind {
  Added,
  Removed,
  Context
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
  pub kind:    LineKind,
  pub content: String
}

impl DiffLine {
  pub fn added(content: impl Into<String>) -> Self {
    Self { kind: LineKind::Added, content: content.into() }
  }

  pub fn removed(content: impl Into<String>) -> Self {
    Self { kind: LineKind::Removed, content: content.into() }
  }

  pub fn context(content: impl Into<String>) -> Self {
    Self { kind: LineKind::Context, content: content.into() }
  }

  fn prefix(&self) -> char {
    match self.kind {
      LineKind::Added => '+',
      LineKind::Removed => '-',
      LineKind::Context => ' '
    }
  }

  pub fn is_change(&self) -> bool {
    self.kind != LineKind::Context
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
  pub header: String,
  pub lines:  Vec<DiffLine>
}

impl Hunk {
  pub fn new(header: impl Into<String>, lines: Vec<DiffLine>) -> Self {
    Self { header: header.into(), lines }
  }

  fn placeholder(text: &str) -> Self {
    Self { header: text.to_string(), lines: Vec::new() }
  }
}

/// One file as delivered by the git layer, before filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFileDiff {
  pub path:     String,
  pub old_path: Option<String>,
  pub kind:     ChangeKind,
  pub binary:   bool,
  pub hunks:    Vec<Hunk>
}

impl RawFileDiff {
  pub fn new(path: impl Into<String>, kind: ChangeKind, hunks: Vec<Hunk>) -> Self {
    Self {
      path: path.into(),
      old_path: None,
      kind,
      binary: kind == ChangeKind::Binary,
      hunks
    }
  }
}

/// A normalized file diff. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
  path:      String,
  old_path:  Option<String>,
  kind:      ChangeKind,
  hunks:     Vec<Hunk>,
  additions: usize,
  deletions: usize,
  bytes:     usize,
  cap:       Option<SizeCap>
}

impl FileDiff {
  /// Normalizes a raw record; `None` when it carries nothing worth describing.
  ///
  /// Line counts always describe the whole change, even when `limits` cut the content.
  fn from_raw(raw: RawFileDiff, limits: &DiffLimits) -> Option<Self> {
    let kind = if raw.binary { ChangeKind::Binary } else { raw.kind };

    let hunks = match kind {
      ChangeKind::Binary => vec![Hunk::placeholder(BINARY_PLACEHOLDER)],
      _ if !raw.hunks.is_empty() => raw.hunks,
      // Mode-only changes have no content to describe
      ChangeKind::Modified => return None,
      _ => vec![Hunk::placeholder(EMPTY_PLACEHOLDER)]
    };

    let additions = count_lines(&hunks, LineKind::Added);
    let deletions = count_lines(&hunks, LineKind::Removed);

    let (hunks, cap) = if kind == ChangeKind::Binary {
      (hunks, None)
    } else if additions + deletions > limits.max_file_lines {
      let note = format!("file {} changed: +{additions} -{deletions} (diff omitted due to size)", raw.path);
      (vec![Hunk::placeholder(&note)], Some(SizeCap::Omitted))
    } else {
      cap_hunks(hunks, limits)
    };

    let mut file = Self {
      path: raw.path,
      old_path: raw.old_path.filter(|_| kind == ChangeKind::Renamed),
      kind,
      hunks,
      additions,
      deletions,
      bytes: 0,
      cap
    };
    file.bytes = file.render().len();
    Some(file)
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn old_path(&self) -> Option<&str> {
    self.old_path.as_deref()
  }

  pub fn kind(&self) -> ChangeKind {
    self.kind
  }

  pub fn hunks(&self) -> &[Hunk] {
    &self.hunks
  }

  pub fn additions(&self) -> usize {
    self.additions
  }

  pub fn deletions(&self) -> usize {
    self.deletions
  }

  /// Length of the rendered diff in bytes.
  pub fn bytes(&self) -> usize {
    self.bytes
  }

  /// Set when [`DiffLimits`] shrank this file.
  pub fn cap(&self) -> Option<SizeCap> {
    self.cap
  }

  pub fn changed_lines(&self) -> usize {
    self.additions + self.deletions
  }

  /// One line description: kind, path and line counts.
  pub fn headline(&self) -> String {
    match &self.old_path {
      Some(old) => format!("{} {} -> {} (+{} -{})", self.kind, old, self.path, self.additions, self.deletions),
      None => format!("{} {} (+{} -{})", self.kind, self.path, self.additions, self.deletions)
    }
  }

  /// Unified-diff style rendering used verbatim in Full prompts.
  pub fn render(&self) -> String {
    let mut out = String::with_capacity(self.bytes.max(64));
    let old = self.old_path.as_deref().unwrap_or(&self.path);
    let _ = writeln!(out, "diff --git a/{} b/{}", old, self.path);
    match self.kind {
      ChangeKind::Added => out.push_str("new file\n"),
      ChangeKind::Deleted => out.push_str("deleted file\n"),
      ChangeKind::Renamed => {
        let _ = writeln!(out, "rename from {old}\nrename to {}", self.path);
      }
      ChangeKind::Binary | ChangeKind::Modified => {}
    }

    for hunk in &self.hunks {
      out.push_str(&hunk.header);
      out.push('\n');
      for line in &hunk.lines {
        out.push(line.prefix());
        out.push_str(&line.content);
        out.push('\n');
      }
    }

    out.truncate(out.trim_end().len());
    out
  }

  /// Changed lines only, grouped by hunk header. Used by the summarizer.
  pub fn condensed_lines(&self) -> Vec<String> {
    let mut lines = Vec::new();
    for hunk in &self.hunks {
      lines.push(hunk.header.clone());
      lines.extend(
        hunk
          .lines
          .iter()
          .filter(|line| line.is_change())
          .map(|line| format!("{}{}", line.prefix(), line.content))
      );
    }
    lines
  }
}

/// Keeps whole lines until the line or byte cap is reached.
fn cap_hunks(hunks: Vec<Hunk>, limits: &DiffLimits) -> (Vec<Hunk>, Option<SizeCap>) {
  let (mut lines, mut bytes) = (0, 0);
  let mut kept = Vec::with_capacity(hunks.len());

  for mut hunk in hunks {
    bytes += hunk.header.len() + 1;
    if bytes > limits.max_file_bytes {
      kept.push(Hunk::placeholder(TRUNCATED_MARKER));
      return (kept, Some(SizeCap::Truncated));
    }

    let overflow = hunk.lines.iter().position(|line| {
      lines += 1;
      bytes += line.content.len() + 2;
      lines > limits.max_file_lines || bytes > limits.max_file_bytes
    });

    if let Some(cut) = overflow {
      hunk.lines.truncate(cut);
      kept.push(hunk);
      kept.push(Hunk::placeholder(TRUNCATED_MARKER));
      return (kept, Some(SizeCap::Truncated));
    }
    kept.push(hunk);
  }

  (kept, None)
}

fn count_lines(hunks: &[Hunk], kind: LineKind) -> usize {
  hunks
    .iter()
    .flat_map(|hunk| hunk.lines.iter())
    .filter(|line| line.kind == kind)
    .count()
}

/// Ordered set of file diffs considered for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffContext {
  files:    Vec<FileDiff>,
  ignored:  usize,
  warnings: Vec<String>
}

impl DiffContext {
  /// [`DiffContext::build_with_limits`] with the default [`DiffLimits`].
  pub fn build(raw: Vec<RawFileDiff>, ignore: &IgnoreSet) -> Result<Self, PipelineError> {
    Self::build_with_limits(raw, ignore, &DiffLimits::default())
  }

  /// Filters `raw` through `ignore` and normalizes what remains, keeping discovery order.
  ///
  /// Files over `limits` are shrunk or left out, with a warning for each.
  /// Fails with [`PipelineError::Collection`] when nothing diffable is left.
  pub fn build_with_limits(raw: Vec<RawFileDiff>, ignore: &IgnoreSet, limits: &DiffLimits) -> Result<Self, PipelineError> {
    let mut ignored = 0;
    let mut dropped = 0;
    let mut warnings = Vec::new();
    let mut files = Vec::with_capacity(raw.len().min(limits.max_files));

    for record in raw {
      let old_ignored = record
        .old_path
        .as_deref()
        .is_some_and(|old| ignore.is_ignored(old));

      if ignore.is_ignored(&record.path) || old_ignored {
        log::debug!("Ignoring {} for the prompt", record.path);
        ignored += 1;
        continue;
      }

      if files.len() >= limits.max_files {
        dropped += 1;
        continue;
      }

      let Some(file) = FileDiff::from_raw(record, limits) else {
        log::debug!("Skipping file without diffable content");
        continue;
      };

      match file.cap {
        Some(SizeCap::Omitted) => warnings.push(format!("diff omitted for {} ({} lines)", file.path, file.changed_lines())),
        Some(SizeCap::Truncated) => warnings.push(format!("diff truncated for {}", file.path)),
        None => {}
      }
      files.push(file);
    }

    if dropped > 0 {
      warnings.push(format!("only first {} files used, {dropped} left out", limits.max_files));
    }
    for warning in &warnings {
      log::info!("{warning}");
    }

    if files.is_empty() {
      return Err(PipelineError::Collection { ignored });
    }

    Ok(Self { files, ignored, warnings })
  }

  pub fn files(&self) -> &[FileDiff] {
    &self.files
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }

  pub fn ignored(&self) -> usize {
    self.ignored
  }

  /// Notes about files that [`DiffLimits`] shrank or left out.
  pub fn warnings(&self) -> &[String] {
    &self.warnings
  }

  pub fn total_bytes(&self) -> usize {
    self.files.iter().map(FileDiff::bytes).sum()
  }

  pub fn total_changed_lines(&self) -> usize {
    self.files.iter().map(FileDiff::changed_lines).sum()
  }

  /// Full diff text, files separated by a blank line.
  pub fn render(&self) -> String {
    self
      .files
      .iter()
      .map(FileDiff::render)
      .collect::<Vec<_>>()
      .join("\n\n")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn modified(path: &str, lines: Vec<DiffLine>) -> RawFileDiff {
    RawFileDiff::new(path, ChangeKind::Modified, vec![Hunk::new("@@ -1,2 +1,2 @@", lines)])
  }

  #[test]
  fn test_build_keeps_discovery_order() {
    let raw = vec![
      modified("b.rs", vec![DiffLine::added("b")]),
      modified("a.rs", vec![DiffLine::added("a")]),
      modified("c.rs", vec![DiffLine::removed("c")]),
    ];
    let ctx = DiffContext::build(raw, &IgnoreSet::empty()).unwrap();
    let paths: Vec<_> = ctx.files().iter().map(FileDiff::path).collect();
    assert_eq!(paths, ["b.rs", "a.rs", "c.rs"]);
  }

  #[test]
  fn test_build_applies_ignore_patterns() {
    let ignore = IgnoreSet::from_patterns(["**/*.lock"]).unwrap();
    let raw = vec![modified("Cargo.lock", vec![DiffLine::added("x")]), modified("src/main.rs", vec![DiffLine::added("y")])];
    let ctx = DiffContext::build(raw, &ignore).unwrap();
    assert_eq!(ctx.len(), 1);
    assert_eq!(ctx.ignored(), 1);
    assert_eq!(ctx.files()[0].path(), "src/main.rs");
  }

  #[test]
  fn test_everything_ignored_is_collection_error() {
    let ignore = IgnoreSet::from_patterns(["**/*.lock"]).unwrap();
    let raw = vec![modified("Cargo.lock", vec![DiffLine::added("x")])];
    let err = DiffContext::build(raw, &ignore).unwrap_err();
    assert!(matches!(err, PipelineError::Collection { ignored: 1 }));
  }

  #[test]
  fn test_empty_input_is_collection_error() {
    let err = DiffContext::build(Vec::new(), &IgnoreSet::empty()).unwrap_err();
    assert!(matches!(err, PipelineError::Collection { ignored: 0 }));
  }

  #[test]
  fn test_binary_gets_placeholder_hunk() {
    let mut raw = RawFileDiff::new("logo.png", ChangeKind::Added, vec![Hunk::new("@@", vec![DiffLine::added("\u{fffd}PNG")])]);
    raw.binary = true;
    let ctx = DiffContext::build(vec![raw], &IgnoreSet::empty()).unwrap();
    let file = &ctx.files()[0];
    assert_eq!(file.kind(), ChangeKind::Binary);
    assert_eq!(file.hunks().len(), 1);
    assert!(file.hunks()[0].lines.is_empty());
    assert!(file.render().contains(BINARY_PLACEHOLDER));
    assert!(!file.render().contains("PNG"));
  }

  #[test]
  fn test_mode_only_change_is_dropped() {
    let raw = vec![RawFileDiff::new("run.sh", ChangeKind::Modified, Vec::new()), modified("src/lib.rs", vec![DiffLine::added("x")])];
    let ctx = DiffContext::build(raw, &IgnoreSet::empty()).unwrap();
    assert_eq!(ctx.len(), 1);
  }

  #[test]
  fn test_empty_added_file_is_kept() {
    let raw = vec![RawFileDiff::new("src/empty.rs", ChangeKind::Added, Vec::new())];
    let ctx = DiffContext::build(raw, &IgnoreSet::empty()).unwrap();
    assert_eq!(ctx.files()[0].headline(), "added src/empty.rs (+0 -0)");
  }

  #[test]
  fn test_rename_ignored_by_old_path() {
    let ignore = IgnoreSet::from_patterns(["vendor/**"]).unwrap();
    let mut raw = RawFileDiff::new("lib/x.rs", ChangeKind::Renamed, Vec::new());
    raw.old_path = Some("vendor/x.rs".into());
    let err = DiffContext::build(vec![raw], &ignore).unwrap_err();
    assert!(matches!(err, PipelineError::Collection { ignored: 1 }));
  }

  #[test]
  fn test_render_and_metrics() {
    let raw = vec![modified("src/lib.rs", vec![DiffLine::context("fn a() {}"), DiffLine::removed("old"), DiffLine::added("new")])];
    let ctx = DiffContext::build(raw, &IgnoreSet::empty()).unwrap();
    let file = &ctx.files()[0];
    assert_eq!(file.render(), "diff --git a/src/lib.rs b/src/lib.rs\n@@ -1,2 +1,2 @@\n fn a() {}\n-old\n+new");
    assert_eq!(file.additions(), 1);
    assert_eq!(file.deletions(), 1);
    assert_eq!(file.bytes(), file.render().len());
    assert_eq!(ctx.total_changed_lines(), 2);
    assert_eq!(file.condensed_lines(), vec!["@@ -1,2 +1,2 @@", "-old", "+new"]);
    assert!(ctx.warnings().is_empty());
  }

  fn added_lines(count: usize) -> Vec<DiffLine> {
    (0..count).map(|n| DiffLine::added(format!("line {n}"))).collect()
  }

  #[test]
  fn test_file_over_line_cap_is_omitted() {
    let limits = DiffLimits { max_file_lines: 10, ..DiffLimits::default() };
    let raw = vec![modified("generated.rs", added_lines(11)), modified("src/lib.rs", added_lines(10))];
    let ctx = DiffContext::build_with_limits(raw, &IgnoreSet::empty(), &limits).unwrap();

    let generated = &ctx.files()[0];
    assert_eq!(generated.cap(), Some(SizeCap::Omitted));
    assert_eq!(generated.additions(), 11);
    assert!(generated.render().contains("file generated.rs changed: +11 -0 (diff omitted due to size)"));
    assert!(!generated.render().contains("line 0"));

    assert_eq!(ctx.files()[1].cap(), None);
    assert_eq!(ctx.warnings(), ["diff omitted for generated.rs (11 lines)"]);
  }

  #[test]
  fn test_context_lines_count_toward_line_cap() {
    let limits = DiffLimits { max_file_lines: 3, ..DiffLimits::default() };
    let lines = vec![DiffLine::context("a"), DiffLine::context("b"), DiffLine::added("c"), DiffLine::context("d")];
    let ctx = DiffContext::build_with_limits(vec![modified("src/lib.rs", lines)], &IgnoreSet::empty(), &limits).unwrap();

    let file = &ctx.files()[0];
    assert_eq!(file.cap(), Some(SizeCap::Truncated));
    assert_eq!(file.hunks()[0].lines.len(), 3);
    assert!(file.render().ends_with(TRUNCATED_MARKER));
    assert_eq!(ctx.warnings(), ["diff truncated for src/lib.rs"]);
  }

  #[test]
  fn test_file_over_byte_cap_is_truncated() {
    let limits = DiffLimits { max_file_bytes: 200, ..DiffLimits::default() };
    let lines = (0..20).map(|n| DiffLine::added(format!("{n:>20}"))).collect();
    let ctx = DiffContext::build_with_limits(vec![modified("src/big.rs", lines)], &IgnoreSet::empty(), &limits).unwrap();

    let file = &ctx.files()[0];
    assert_eq!(file.cap(), Some(SizeCap::Truncated));
    // 16 bytes of hunk header, 22 per line
    assert_eq!(file.hunks()[0].lines.len(), 8);
    assert_eq!(file.additions(), 20);
    assert_eq!(ctx.warnings(), ["diff truncated for src/big.rs"]);
  }

  #[test]
  fn test_files_beyond_cap_are_left_out() {
    let limits = DiffLimits { max_files: 2, ..DiffLimits::default() };
    let raw = vec![
      modified("Cargo.lock", added_lines(1)),
      modified("a.rs", added_lines(1)),
      modified("b.rs", added_lines(1)),
      modified("c.rs", added_lines(1)),
      modified("d.rs", added_lines(1)),
    ];
    let ignore = IgnoreSet::from_patterns(["**/*.lock"]).unwrap();
    let ctx = DiffContext::build_with_limits(raw, &ignore, &limits).unwrap();

    let paths: Vec<_> = ctx.files().iter().map(FileDiff::path).collect();
    assert_eq!(paths, ["a.rs", "b.rs"]);
    assert_eq!(ctx.ignored(), 1);
    assert_eq!(ctx.warnings(), ["only first 2 files used, 2 left out"]);
  }
}
