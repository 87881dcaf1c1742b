//! Unified diff text parsing.
//!
//! Turns the output of `git diff --cached` (or `git show`) into raw records so
//! the pipeline can run without libgit2, e.g. from a hook that pipes a patch in.

use super::{ChangeKind, DiffLine, Hunk, RawFileDiff};

/// Extracts the file paths from a `diff --git` header.
///
/// Handles the a/, b/, c/, i/, w/ prefixes git uses depending on the diff
/// source, and /dev/null for added or deleted files. Returns (old, new).
fn paths_from_header(line: &str) -> Option<(String, String)> {
  let parts: Vec<&str> = line.split_whitespace().collect();
  if parts.len() < 4 {
    return None;
  }

  let strip_prefix = |s: &str| {
    for prefix in ["a/", "b/", "c/", "i/", "w/"] {
      if let Some(rest) = s.strip_prefix(prefix) {
        return rest.to_string();
      }
    }
    s.to_string()
  };

  let old = strip_prefix(parts[2]);
  let new = strip_prefix(parts[3]);
  Some(if new == "/dev/null" || new == "dev/null" { (old.clone(), old) } else { (old, new) })
}

fn is_commit_hash_line(line: &str) -> bool {
  line.starts_with("commit ") || (line.len() >= 40 && line.chars().take(40).all(|c| c.is_ascii_hexdigit()))
}

struct Builder {
  record: RawFileDiff,
  hunk:   Option<Hunk>
}

impl Builder {
  fn new(old: String, new: String) -> Self {
    let mut record = RawFileDiff::new(new, ChangeKind::Modified, Vec::new());
    record.old_path = Some(old);
    Self { record, hunk: None }
  }

  fn flush_hunk(&mut self) {
    if let Some(hunk) = self.hunk.take() {
      self.record.hunks.push(hunk);
    }
  }

  fn finish(mut self) -> RawFileDiff {
    self.flush_hunk();
    if self.record.kind != ChangeKind::Renamed {
      self.record.old_path = None;
    }
    self.record
  }
}

/// Parses unified diff text into per-file records in the order they appear.
///
/// Lines outside a `diff --git` section (commit headers, messages) are skipped.
pub fn parse_patch(text: &str) -> Vec<RawFileDiff> {
  let mut files = Vec::new();
  let mut current: Option<Builder> = None;

  log::debug!("Parsing patch with {} lines", text.lines().count());

  for line in text.lines() {
    if line.starts_with("diff --git") {
      if let Some(builder) = current.take() {
        files.push(builder.finish());
      }
      current = paths_from_header(line).map(|(old, new)| Builder::new(old, new));
      if current.is_none() {
        log::warn!("Unparseable diff header: {line}");
      }
      continue;
    }

    let Some(builder) = current.as_mut() else {
      if !is_commit_hash_line(line) && !line.trim().is_empty() {
        log::trace!("Skipping preamble line: {line}");
      }
      continue;
    };

    if line.starts_with("@@") {
      builder.flush_hunk();
      builder.hunk = Some(Hunk::new(line, Vec::new()));
      continue;
    }

    if let Some(hunk) = builder.hunk.as_mut() {
      match line.chars().next() {
        Some('+') => hunk.lines.push(DiffLine::added(&line[1..])),
        Some('-') => hunk.lines.push(DiffLine::removed(&line[1..])),
        Some(' ') => hunk.lines.push(DiffLine::context(&line[1..])),
        // "\ No newline at end of file"
        Some('\\') => {}
        None => hunk.lines.push(DiffLine::context("")),
        Some(_) => log::trace!("Unexpected line inside hunk: {line}")
      }
      continue;
    }

    let record = &mut builder.record;
    if line.starts_with("new file mode") {
      record.kind = ChangeKind::Added;
    } else if line.starts_with("deleted file mode") {
      record.kind = ChangeKind::Deleted;
    } else if let Some(from) = line.strip_prefix("rename from ") {
      record.kind = ChangeKind::Renamed;
      record.old_path = Some(from.to_string());
    } else if let Some(to) = line.strip_prefix("rename to ") {
      record.kind = ChangeKind::Renamed;
      record.path = to.to_string();
    } else if line.starts_with("Binary files") || line.starts_with("GIT binary patch") {
      record.binary = true;
    }
  }

  if let Some(builder) = current {
    files.push(builder.finish());
  }

  log::debug!("Parsed {} files from patch", files.len());
  files
}
