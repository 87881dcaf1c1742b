#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use commitgen::diff::{ChangeKind, DiffLine, Hunk, RawFileDiff};
use commitgen::error::{ProviderError, ProviderErrorKind};
use commitgen::provider::{Provider, ProviderContext, ProviderRequest};
use parking_lot::Mutex;
use tempfile::TempDir;

pub struct TestRepo {
  pub repo:      git2::Repository,
  pub repo_path: TempDir
}

impl Default for TestRepo {
  fn default() -> Self {
    let repo_path = TempDir::new().unwrap();
    let repo = git2::Repository::init(repo_path.path()).unwrap();
    Self { repo, repo_path }
  }
}

impl TestRepo {
  pub fn create_file(&self, name: &str, content: &str) -> Result<GitFile> {
    let file_path = self.repo_path.path().join(name);
    if let Some(parent) = file_path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&file_path, content)?;
    let repo = git2::Repository::open(self.repo.path())?;
    Ok(GitFile::new(repo, file_path, self.repo_path.path().to_path_buf()))
  }

  /// Moves a tracked file in the index, leaving the rename for git to detect.
  pub fn rename(&self, from: &str, to: &str) -> Result<()> {
    let root = self.repo_path.path();
    std::fs::rename(root.join(from), root.join(to))?;
    let mut index = self.repo.index()?;
    index.remove_path(std::path::Path::new(from))?;
    index.add_path(std::path::Path::new(to))?;
    index.write()?;
    Ok(())
  }
}

pub struct GitFile {
  pub repo:      git2::Repository,
  pub path:      PathBuf,
  pub repo_path: PathBuf
}

impl GitFile {
  pub fn new(repo: git2::Repository, path: PathBuf, repo_path: PathBuf) -> Self {
    Self { repo, path, repo_path }
  }

  pub fn stage(&self) -> Result<()> {
    let mut index = self.repo.index()?;

    let relative_path = self.path.strip_prefix(&self.repo_path)?;
    if !self.path.exists() {
      index.remove_path(relative_path)?;
    } else {
      index.add_path(relative_path)?;
    }
    index.write()?;

    Ok(())
  }

  pub fn commit(&self) -> Result<()> {
    let mut index = self.repo.index()?;
    let oid = index.write_tree()?;
    let signature = git2::Signature::now("Your Name", "email@example.com")?;
    let tree = self.repo.find_tree(oid)?;

    match self.repo.head().and_then(|head| head.peel_to_commit()) {
      Ok(parent) => {
        self
          .repo
          .commit(Some("HEAD"), &signature, &signature, "Commit message", &tree, &[&parent])?;
      }
      Err(_) => {
        self
          .repo
          .commit(Some("HEAD"), &signature, &signature, "Initial commit", &tree, &[])?;
      }
    }

    Ok(())
  }

  pub fn delete(&self) -> Result<()> {
    std::fs::remove_file(&self.path)?;
    Ok(())
  }
}

/// Raw records for `files` modified files with `lines` added lines each.
pub fn raw_files(files: usize, lines: usize) -> Vec<RawFileDiff> {
  (0..files)
    .map(|i| {
      let added = (0..lines)
        .map(|n| DiffLine::added(format!("    let value_{n} = service_{i}.compute({n}).await?;")))
        .collect();
      RawFileDiff::new(format!("src/service_{i}.rs"), ChangeKind::Modified, vec![Hunk::new(format!("@@ -1,0 +1,{lines} @@"), added)])
    })
    .collect()
}

pub enum Reply {
  Text(&'static str),
  Fail(ProviderErrorKind),
  Hang
}

/// Provider that plays back a fixed script, one reply per request.
pub struct ScriptedProvider {
  script:   Mutex<VecDeque<Reply>>,
  requests: Mutex<Vec<ProviderRequest>>
}

impl ScriptedProvider {
  pub fn new(script: Vec<Reply>) -> Self {
    Self { script: Mutex::new(script.into()), requests: Mutex::new(Vec::new()) }
  }

  pub fn calls(&self) -> usize {
    self.requests.lock().len()
  }

  pub fn requests(&self) -> Vec<ProviderRequest> {
    self.requests.lock().clone()
  }
}

#[async_trait]
impl Provider for ScriptedProvider {
  fn name(&self) -> &'static str {
    "scripted"
  }

  fn model(&self) -> &str {
    "scripted-model"
  }

  async fn complete(&self, _ctx: &ProviderContext, request: &ProviderRequest) -> Result<String, ProviderError> {
    self.requests.lock().push(request.clone());
    let reply = self.script.lock().pop_front();

    match reply {
      Some(Reply::Text(text)) => Ok(text.to_string()),
      Some(Reply::Fail(kind)) => Err(ProviderError::new("scripted", kind, format!("scripted {kind} failure"))),
      Some(Reply::Hang) => {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(ProviderError::new("scripted", ProviderErrorKind::Network, "hung"))
      }
      None => Err(ProviderError::new("scripted", ProviderErrorKind::Malformed, "script exhausted"))
    }
  }
}
