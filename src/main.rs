use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use commitgen::config::{App, ConfigPaths};
use commitgen::diff::{parse_patch, RawFileDiff};
use commitgen::events::LogSink;
use commitgen::git::StagedChanges;
use commitgen::ignore::IgnoreSet;
use commitgen::{provider, CancelToken, GeneratedMessage, Pipeline, Settings};
use console::Emoji;
use env_logger::Env;
use git2::Repository;
use indicatif::{ProgressBar, ProgressStyle};

const EMOJI: Emoji<'_, '_> = Emoji("🤖 ", "");

#[derive(Parser, Debug)]
#[command(author, version, about = "Generates commit messages for staged changes")]
struct Cli {
  #[command(subcommand)]
  command: Option<Commands>,

  #[command(flatten)]
  generate: GenerateArgs,

  /// Enables verbose logging
  #[arg(short, long, global = true)]
  verbose: bool
}

#[derive(Subcommand, Debug)]
enum Commands {
  /// Generates a message for the staged changes (default)
  Generate(GenerateArgs),
  /// Reads or changes the configuration file
  #[command(subcommand)]
  Config(ConfigCommand)
}

#[derive(Args, Debug, Default)]
struct GenerateArgs {
  /// Writes the message in front of this file's contents, e.g. a prepare-commit-msg file
  #[arg(short, long)]
  output: Option<PathBuf>,

  /// Reads a unified diff from stdin instead of the git index
  #[arg(long)]
  stdin: bool,

  /// Logs every pipeline event as JSON
  #[arg(long)]
  events: bool
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
  /// Sets one option, e.g. `config set provider openai`
  Set { key: String, value: String },
  /// Prints the configuration with the API key masked
  Show,
  /// Restores the defaults
  Reset
}

fn init_logging(verbose: bool) {
  let level = if verbose { "debug" } else { "warn" };
  env_logger::Builder::from_env(Env::default().default_filter_or(level))
    .format_target(false)
    .init();
}

fn spinner() -> Result<ProgressBar> {
  let style = ProgressStyle::default_spinner()
    .tick_strings(&["-", "\\", "|", "/", ""])
    .template("{spinner:.blue} {msg}")
    .context("Failed to create progress bar style")?;

  let pb = ProgressBar::new_spinner();
  pb.set_style(style);
  pb.set_message("Generating commit message...");
  pb.enable_steady_tick(Duration::from_millis(150));
  Ok(pb)
}

fn collect(args: &GenerateArgs) -> Result<Vec<RawFileDiff>> {
  if args.stdin {
    let mut patch = String::new();
    std::io::stdin()
      .read_to_string(&mut patch)
      .context("Failed to read diff from stdin")?;
    let records = parse_patch(&patch);
    if records.is_empty() {
      bail!("No diff found on stdin");
    }
    return Ok(records);
  }

  let repo = Repository::open_from_env().context("Failed to open git repository")?;
  let records = repo.staged_changes()?;
  if records.is_empty() {
    bail!("No staged changes. Stage files with `git add` first");
  }
  Ok(records)
}

fn write_output(path: &Path, message: &GeneratedMessage) -> Result<()> {
  // Keep the comment template git placed in the file
  let existing = fs::read_to_string(path).unwrap_or_default();
  let contents = if existing.is_empty() { format!("{}\n", message.text) } else { format!("{}\n{existing}", message.text) };
  fs::write(path, contents).with_context(|| format!("Failed to write commit message to {}", path.display()))
}

async fn generate(settings: Settings, args: &GenerateArgs) -> Result<()> {
  let raw = collect(args)?;
  let ignore = IgnoreSet::new(&settings.ignore)?;
  let provider = provider::build(&settings)?;
  let sink = LogSink::new(args.events);
  let pipeline = Pipeline::new(&settings, provider.as_ref(), &sink)?;

  let cancel = CancelToken::new();
  let handler = cancel.clone();
  ctrlc::set_handler(move || handler.cancel()).context("Failed to install Ctrl-C handler")?;

  let pb = spinner()?;
  let result = pipeline.run(raw, &ignore, &cancel).await;
  pb.finish_and_clear();
  let message = result?;

  for warning in &message.warnings {
    eprintln!("{} {}", "warning:".yellow().bold(), warning.yellow());
  }
  if !message.validated {
    eprintln!("{} {}", "warning:".yellow().bold(), "the message does not follow the expected format".yellow());
  }

  match &args.output {
    Some(path) => write_output(path, &message)?,
    None => println!("{}", message.text)
  }

  eprintln!(
    "{EMOJI}{} ({} prompt, {})",
    "Commit message generated".green(),
    message.strategy,
    settings.model.italic()
  );
  Ok(())
}

fn configure(command: ConfigCommand) -> Result<()> {
  let paths = ConfigPaths::new()?;
  match command {
    ConfigCommand::Set { key, value } => {
      let mut app = App::load(&paths)?;
      app.set(&key, &value)?;
      app.resolve()?;
      app.save(&paths)?;
      println!("{} {key}", "Updated".green());
    }
    ConfigCommand::Show => {
      let app = App::load(&paths)?;
      let contents = serde_ini::to_string(&app.redacted()).context("Failed to serialize config")?;
      println!("# {}", paths.file.display().to_string().italic());
      print!("{contents}");
    }
    ConfigCommand::Reset => {
      App::default().save(&paths)?;
      println!("{} {}", "Reset".green(), paths.file.display());
    }
  }
  Ok(())
}

async fn execute(cli: Cli) -> Result<()> {
  match cli.command {
    Some(Commands::Config(command)) => configure(command),
    Some(Commands::Generate(args)) => generate(App::load(&ConfigPaths::new()?)?.resolve()?, &args).await,
    None => generate(App::load(&ConfigPaths::new()?)?.resolve()?, &cli.generate).await
  }
}

#[tokio::main]
async fn main() {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  if let Err(err) = execute(cli).await {
    eprintln!("{} {:#}", "error:".red().bold(), err);
    std::process::exit(1);
  }
}
