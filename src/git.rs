//! Staged change collection through libgit2.

use std::path::PathBuf;

use anyhow::{Context, Result};
use git2::{Delta, Diff, DiffFindOptions, DiffOptions, Patch, Repository, Tree};

use crate::diff::{ChangeKind, DiffLine, Hunk, RawFileDiff};
use crate::profile;

/// Extension trait for git2::DiffDelta to get file paths
pub trait DiffDeltaPath {
  fn path(&self) -> PathBuf;
}

impl DiffDeltaPath for git2::DiffDelta<'_> {
  fn path(&self) -> PathBuf {
    self
      .new_file()
      .path()
      .or_else(|| self.old_file().path())
      .map(PathBuf::from)
      .unwrap_or_default()
  }
}

pub trait StagedChanges {
  /// Staged changes relative to `tree`, or to an empty tree when there is no HEAD yet.
  fn staged_diff(&self, tree: Option<Tree<'_>>) -> Result<Diff<'_>>;
  /// Raw per-file records for everything in the index that differs from HEAD.
  fn staged_changes(&self) -> Result<Vec<RawFileDiff>>;
  /// Whether anything is staged at all. Compares trees only, without building patches.
  fn has_staged_changes(&self) -> Result<bool>;
}

impl StagedChanges for Repository {
  fn staged_diff(&self, tree: Option<Tree<'_>>) -> Result<Diff<'_>> {
    profile!("Git staged diff");
    let mut opts = DiffOptions::new();
    opts
      .ignore_whitespace_eol(true)
      .ignore_submodules(true)
      .include_untracked(false)
      .include_ignored(false)
      .interhunk_lines(0)
      .context_lines(1)
      .patience(true)
      .minimal(true);

    let tree = match tree {
      Some(tree) => tree,
      None => self.find_tree(self.treebuilder(None)?.write()?)?
    };

    let mut diff = self
      .diff_tree_to_index(Some(&tree), None, Some(&mut opts))
      .context("Failed to get staged diff")?;

    let mut find = DiffFindOptions::new();
    find.renames(true);
    diff.find_similar(Some(&mut find)).context("Failed to detect renames")?;
    Ok(diff)
  }

  fn staged_changes(&self) -> Result<Vec<RawFileDiff>> {
    let head = self.head().ok().and_then(|head| head.peel_to_tree().ok());
    let diff = self.staged_diff(head)?;
    collect_records(&diff)
  }

  fn has_staged_changes(&self) -> Result<bool> {
    let head = self.head().ok().and_then(|head| head.peel_to_tree().ok());
    let diff = self
      .diff_tree_to_index(head.as_ref(), None, None)
      .context("Failed to get staged diff")?;
    Ok(diff.deltas().len() > 0)
  }
}

fn change_kind(status: Delta) -> ChangeKind {
  match status {
    Delta::Added | Delta::Copied | Delta::Untracked => ChangeKind::Added,
    Delta::Deleted => ChangeKind::Deleted,
    Delta::Renamed => ChangeKind::Renamed,
    _ => ChangeKind::Modified
  }
}

/// Converts every delta of `diff` into a raw record, in delta order.
pub fn collect_records(diff: &Diff<'_>) -> Result<Vec<RawFileDiff>> {
  profile!("Collect diff records");
  let mut records = Vec::with_capacity(diff.deltas().len());

  for idx in 0..diff.deltas().len() {
    let Some(delta) = diff.get_delta(idx) else { continue };
    let path = delta.path().to_string_lossy().into_owned();
    let kind = change_kind(delta.status());
    let patch = Patch::from_diff(diff, idx).with_context(|| format!("Failed to build patch for {path}"))?;

    let mut record = RawFileDiff::new(path, kind, Vec::new());
    if kind == ChangeKind::Renamed {
      record.old_path = delta
        .old_file()
        .path()
        .map(|p| p.to_string_lossy().into_owned());
    }

    // Patch::from_diff returns None for binary content
    let binary = delta.flags().is_binary() || delta.new_file().is_binary() || delta.old_file().is_binary();
    match patch {
      Some(patch) if !binary => {
        for hunk_idx in 0..patch.num_hunks() {
          let (hunk, line_count) = patch.hunk(hunk_idx)?;
          let mut lines = Vec::with_capacity(line_count);
          for line_idx in 0..line_count {
            let line = patch.line_in_hunk(hunk_idx, line_idx)?;
            let content = String::from_utf8_lossy(line.content());
            let content = content.trim_end_matches(['\n', '\r']);
            match line.origin() {
              '+' => lines.push(DiffLine::added(content)),
              '-' => lines.push(DiffLine::removed(content)),
              ' ' => lines.push(DiffLine::context(content)),
              _ => {}
            }
          }
          let header = String::from_utf8_lossy(hunk.header());
          record.hunks.push(Hunk::new(header.trim_end(), lines));
        }
      }
      _ => record.binary = true
    }

    records.push(record);
  }

  Ok(records)
}
