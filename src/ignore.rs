//! Path globs excluded from the prompt (never from staging).

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::PipelineError;

// Lockfiles, build output and minified assets say nothing useful about intent
const DEFAULT_PATTERNS: &[&str] = &[
  "**/node_modules/**",
  "**/dist/**",
  "**/build/**",
  "**/.next/**",
  "**/coverage/**",
  "**/target/**",
  "**/*.lock",
  "**/package-lock.json",
  "**/pnpm-lock.yaml",
  "**/yarn.lock",
  "**/bun.lockb",
  "**/*.pbxproj",
  "**/*.min.js",
  "**/*.min.css",
  "**/*.map"
];

#[derive(Debug, Clone)]
pub struct IgnoreSet {
  globs:    GlobSet,
  patterns: usize
}

impl IgnoreSet {
  /// Built-in defaults plus the user's globs.
  pub fn new<S: AsRef<str>>(extra: &[S]) -> Result<Self, PipelineError> {
    let patterns = DEFAULT_PATTERNS
      .iter()
      .copied()
      .chain(extra.iter().map(AsRef::as_ref));
    Self::from_patterns(patterns)
  }

  /// Exactly the given globs, without defaults.
  pub fn from_patterns<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<Self, PipelineError> {
    let mut builder = GlobSetBuilder::new();
    let mut count = 0;

    for pattern in patterns.into_iter().map(str::trim).filter(|p| !p.is_empty()) {
      let glob = Glob::new(pattern).map_err(|e| PipelineError::Config(format!("invalid ignore pattern {pattern:?}: {e}")))?;
      builder.add(glob);
      count += 1;
    }

    let globs = builder
      .build()
      .map_err(|e| PipelineError::Config(format!("invalid ignore patterns: {e}")))?;

    Ok(Self { globs, patterns: count })
  }

  pub fn empty() -> Self {
    Self { globs: GlobSet::empty(), patterns: 0 }
  }

  pub fn is_ignored(&self, path: &str) -> bool {
    self.globs.is_match(path)
  }

  pub fn len(&self) -> usize {
    self.patterns
  }

  pub fn is_empty(&self) -> bool {
    self.patterns == 0
  }
}
