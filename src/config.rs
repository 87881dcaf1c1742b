use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, FileFormat};
use serde::{Deserialize, Serialize};

use crate::budget::{TokenBudget, Tokenizer};
use crate::diff::DiffLimits;
use crate::error::PipelineError;
use crate::provider::retry::RetryPolicy;

// Constants
const DEFAULT_PROVIDER: &str = "ollama";
const DEFAULT_MODEL: &str = "qwen2.5-coder:1.5b";
const DEFAULT_OPENAI_MODE: &str = "auto";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_TIMEOUT: u64 = 20;
const DEFAULT_MAX_INPUT_TOKENS: usize = 6000;
const DEFAULT_MAX_OUTPUT_TOKENS: usize = 2048;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 200;
const DEFAULT_RETRY_MAX_MS: u64 = 2000;
const DEFAULT_SUMMARY_CONCURRENCY: usize = 4;
const DEFAULT_TEMPERATURE: f64 = 0.2;
const ENV_PREFIX: &str = "COMMITGEN";
pub const API_KEY_PLACEHOLDER: &str = "<PLACE HOLDER FOR YOUR API KEY>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
  OpenAI,
  Ollama
}

impl ProviderKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ProviderKind::OpenAI => "openai",
      ProviderKind::Ollama => "ollama"
    }
  }
}

impl FromStr for ProviderKind {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_lowercase().as_str() {
      "openai" => Ok(ProviderKind::OpenAI),
      "ollama" => Ok(ProviderKind::Ollama),
      other => bail!("Unknown provider: {}", other)
    }
  }
}

impl fmt::Display for ProviderKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Request shape used against the cloud backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenAIMode {
  Auto,
  Chat,
  Responses
}

impl FromStr for OpenAIMode {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_lowercase().as_str() {
      "auto" => Ok(OpenAIMode::Auto),
      "chat" => Ok(OpenAIMode::Chat),
      "responses" => Ok(OpenAIMode::Responses),
      other => bail!("Unknown openai mode: {}", other)
    }
  }
}

/// Raw configuration as read from disk and the environment.
///
/// Everything is optional here; [`App::resolve`] applies defaults and checks the
/// values that the pipeline relies on.
#[derive(Debug, Default, Clone, Deserialize, PartialEq, Serialize)]
pub struct App {
  pub provider:            Option<String>,
  pub model:               Option<String>,
  pub openai_mode:         Option<String>,
  pub openai_base_url:     Option<String>,
  pub openai_api_key:      Option<String>,
  pub ollama_url:          Option<String>,
  pub conventional:        Option<bool>,
  pub one_line:            Option<bool>,
  pub emoji:               Option<bool>,
  pub language:            Option<String>,
  pub push:                Option<bool>,
  pub timeout:             Option<u64>,
  pub overall_timeout:     Option<u64>,
  pub max_input_tokens:    Option<usize>,
  pub max_output_tokens:   Option<usize>,
  pub max_attempts:        Option<u32>,
  pub retry_base_ms:       Option<u64>,
  pub retry_max_ms:        Option<u64>,
  pub summary_concurrency: Option<usize>,
  pub max_files:           Option<usize>,
  pub max_file_lines:      Option<usize>,
  pub max_file_bytes:      Option<usize>,
  pub temperature:         Option<f64>,
  pub tokenizer:           Option<String>,
  /// Comma separated globs
  pub ignore:              Option<String>
}

#[derive(Debug)]
pub struct ConfigPaths {
  pub dir:  PathBuf,
  pub file: PathBuf
}

impl ConfigPaths {
  pub fn new() -> Result<Self> {
    let dir = home::home_dir()
      .context("Failed to determine home directory")?
      .join(".config/git-commitgen");
    let file = dir.join("config.ini");
    Ok(Self { dir, file })
  }

  fn ensure_exists(&self) -> Result<()> {
    if !self.dir.exists() {
      std::fs::create_dir_all(&self.dir).with_context(|| format!("Failed to create config directory at {:?}", self.dir))?;
    }
    if !self.file.exists() {
      File::create(&self.file).with_context(|| format!("Failed to create config file at {:?}", self.file))?;
    }
    Ok(())
  }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static
{
  value
    .trim()
    .parse::<T>()
    .with_context(|| format!("Expected a number in range for {key}"))
}

impl App {
  /// Loads `~/.config/git-commitgen/config.ini` overlaid with `COMMITGEN_*` variables.
  pub fn load(paths: &ConfigPaths) -> Result<Self> {
    dotenv::dotenv().ok();
    paths.ensure_exists()?;

    let config = Config::builder()
      .add_source(config::File::new(paths.file.to_string_lossy().as_ref(), FileFormat::Ini))
      .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
      .build()?;

    config
      .try_deserialize()
      .context("Failed to deserialize existing config. Please run `git commitgen config reset` and try again")
  }

  pub fn save(&self, paths: &ConfigPaths) -> Result<()> {
    let contents = serde_ini::to_string(&self).context("Failed to serialize config")?;
    let mut file = File::create(&paths.file).with_context(|| format!("Failed to create config file at {:?}", paths.file))?;
    file
      .write_all(contents.as_bytes())
      .context("Failed to write config file")
  }

  /// Sets a single option by its dashed CLI name.
  pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
    let parse_bool = |v: &str| v.parse::<bool>().with_context(|| format!("Expected true or false for {key}"));

    match key {
      "provider" => {
        ProviderKind::from_str(value)?;
        self.provider = Some(value.to_string());
      }
      "model" => self.model = Some(value.to_string()),
      "openai-mode" => {
        OpenAIMode::from_str(value)?;
        self.openai_mode = Some(value.to_string());
      }
      "openai-base-url" => self.openai_base_url = Some(value.to_string()),
      "openai-api-key" => self.openai_api_key = Some(value.to_string()),
      "ollama-url" => self.ollama_url = Some(value.to_string()),
      "conventional" => self.conventional = Some(parse_bool(value)?),
      "one-line" => self.one_line = Some(parse_bool(value)?),
      "emoji" => self.emoji = Some(parse_bool(value)?),
      "language" => self.language = Some(value.to_string()),
      "push" => self.push = Some(parse_bool(value)?),
      "timeout" => self.timeout = Some(parse_number(key, value)?),
      "overall-timeout" => self.overall_timeout = Some(parse_number(key, value)?),
      "max-input-tokens" => self.max_input_tokens = Some(parse_number(key, value)?),
      "max-output-tokens" => self.max_output_tokens = Some(parse_number(key, value)?),
      "max-attempts" => self.max_attempts = Some(parse_number(key, value)?),
      "retry-base-ms" => self.retry_base_ms = Some(parse_number(key, value)?),
      "retry-max-ms" => self.retry_max_ms = Some(parse_number(key, value)?),
      "summary-concurrency" => self.summary_concurrency = Some(parse_number(key, value)?),
      "max-files" => self.max_files = Some(parse_number(key, value)?),
      "max-file-lines" => self.max_file_lines = Some(parse_number(key, value)?),
      "max-file-bytes" => self.max_file_bytes = Some(parse_number(key, value)?),
      "temperature" => self.temperature = Some(value.parse().with_context(|| format!("Expected a float for {key}"))?),
      "tokenizer" => {
        Tokenizer::from_str(value)?;
        self.tokenizer = Some(value.to_string());
      }
      "ignore" => self.ignore = Some(value.to_string()),
      other => bail!("Unknown configuration option: {}", other)
    }
    Ok(())
  }

  /// Applies defaults and validates into the immutable settings the pipeline consumes.
  pub fn resolve(&self) -> Result<Settings, PipelineError> {
    let invalid = |e: anyhow::Error| PipelineError::Config(e.to_string());

    let provider = ProviderKind::from_str(self.provider.as_deref().unwrap_or(DEFAULT_PROVIDER)).map_err(invalid)?;
    let openai_mode = OpenAIMode::from_str(self.openai_mode.as_deref().unwrap_or(DEFAULT_OPENAI_MODE)).map_err(invalid)?;
    let tokenizer = Tokenizer::from_str(self.tokenizer.as_deref().unwrap_or("heuristic")).map_err(invalid)?;

    let budget = TokenBudget::new(
      self.max_input_tokens.unwrap_or(DEFAULT_MAX_INPUT_TOKENS),
      self.max_output_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS)
    )?;

    let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
    if timeout == 0 {
      return Err(PipelineError::Config("timeout must be greater than zero".into()));
    }

    let max_attempts = self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
    if max_attempts == 0 {
      return Err(PipelineError::Config("max_attempts must be at least 1".into()));
    }

    let retry = RetryPolicy {
      max_attempts,
      base_delay: Duration::from_millis(self.retry_base_ms.unwrap_or(DEFAULT_RETRY_BASE_MS)),
      max_delay: Duration::from_millis(self.retry_max_ms.unwrap_or(DEFAULT_RETRY_MAX_MS)),
      jitter: true
    };

    // Every attempt may use the whole per-request timeout, plus backoff and one regeneration
    let overall_timeout = self
      .overall_timeout
      .map(Duration::from_secs)
      .unwrap_or_else(|| {
        Duration::from_secs(timeout.saturating_mul(u64::from(max_attempts)).saturating_mul(2))
          .saturating_add(retry.max_delay.saturating_mul(max_attempts))
      });

    let defaults = DiffLimits::default();
    let limits = DiffLimits {
      max_files:      self.max_files.unwrap_or(defaults.max_files),
      max_file_lines: self.max_file_lines.unwrap_or(defaults.max_file_lines),
      max_file_bytes: self.max_file_bytes.unwrap_or(defaults.max_file_bytes)
    };
    if limits.max_files == 0 || limits.max_file_lines == 0 || limits.max_file_bytes == 0 {
      return Err(PipelineError::Config("max_files, max_file_lines and max_file_bytes must be greater than zero".into()));
    }

    let api_key = self
      .openai_api_key
      .clone()
      .filter(|key| !key.trim().is_empty() && key != API_KEY_PLACEHOLDER)
      .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|key| !key.trim().is_empty()));

    let ignore = self
      .ignore
      .as_deref()
      .map(|globs| {
        globs
          .split(',')
          .map(str::trim)
          .filter(|g| !g.is_empty())
          .map(String::from)
          .collect()
      })
      .unwrap_or_default();

    Ok(Settings {
      provider,
      model: self.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
      openai_mode,
      openai_base_url: self
        .openai_base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
      openai_api_key: api_key,
      ollama_url: self
        .ollama_url
        .clone()
        .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
      conventional: self.conventional.unwrap_or(true),
      one_line: self.one_line.unwrap_or(true),
      emoji: self.emoji.unwrap_or(false),
      language: self.language.clone().filter(|l| !l.trim().is_empty()),
      push: self.push.unwrap_or(true),
      temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE) as f32,
      budget,
      request_timeout: Duration::from_secs(timeout),
      overall_timeout,
      retry,
      summary_concurrency: self
        .summary_concurrency
        .unwrap_or(DEFAULT_SUMMARY_CONCURRENCY)
        .max(1),
      tokenizer,
      limits,
      ignore
    })
  }

  /// Copy with the credential masked, for display.
  pub fn redacted(&self) -> Self {
    let mut copy = self.clone();
    if copy.openai_api_key.is_some() {
      copy.openai_api_key = Some("***".to_string());
    }
    copy
  }
}

/// Fully resolved configuration, threaded by reference through every stage.
#[derive(Debug, Clone)]
pub struct Settings {
  pub provider:            ProviderKind,
  pub model:               String,
  pub openai_mode:         OpenAIMode,
  pub openai_base_url:     String,
  pub openai_api_key:      Option<String>,
  pub ollama_url:          String,
  pub conventional:        bool,
  pub one_line:            bool,
  pub emoji:               bool,
  pub language:            Option<String>,
  /// Consumed by the commit step, not by the pipeline
  pub push:                bool,
  pub temperature:         f32,
  pub budget:              TokenBudget,
  pub request_timeout:     Duration,
  pub overall_timeout:     Duration,
  pub retry:               RetryPolicy,
  pub summary_concurrency: usize,
  pub tokenizer:           Tokenizer,
  /// Per-file caps applied while collecting the diff
  pub limits:              DiffLimits,
  pub ignore:              Vec<String>
}

impl Default for Settings {
  fn default() -> Self {
    App::default()
      .resolve()
      .expect("built-in defaults are valid")
  }
}
