// LibriSplit - Chapter-aware audiobook splitter
// Copyright (C) 2025 Henning Berge
//
// This program works alongside Libation (https://github.com/rmcrackan/Libation)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! LibriSplit command line
//!
//! `librisplit` with no arguments runs the whole pipeline with the
//! configured library. See `librisplit --help` for the other commands.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{HumanDuration, MultiProgress, ProgressBar, ProgressStyle};
use librisplit::audio::chapters::{load_chapter_table, FfprobeChapterProbe};
use librisplit::audio::cutter::FfmpegCutter;
use librisplit::audio::metadata::format_ffmpeg_timestamp;
use librisplit::config::{Config, LibrarySource};
use librisplit::file::paths::{part_file_name, source_extension};
use librisplit::file::OutputLayout;
use librisplit::error::SplitError;
use librisplit::jobs::{JobState, JobTracker};
use librisplit::library::{filter_by_author, BookSource, DirectoryLibrary, LibationCli, NoDownloader};
use librisplit::pipeline::{Orchestrator, ProgressCallback, ProgressEvent, RunSummary};
use librisplit::split::plan;
use librisplit::storage::{Database, JobStore};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exit status after an interrupt
const EXIT_INTERRUPTED: u8 = 130;

/// Progress bar resolution of one part
const PART_TICKS: u64 = 1000;

#[derive(Parser)]
#[command(name = "librisplit", version)]
#[command(about = "Split long audiobooks into chapter-aligned parts", long_about = None)]
struct Cli {
    /// Config file (default: platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output folder for the parts
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Maximum part length in hours
    #[arg(long, global = true)]
    max_hours: Option<f64>,

    /// Books processed in parallel
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Only books whose author contains this text
    #[arg(long, global = true)]
    author: Option<String>,

    /// Process a folder of audio files instead of a Libation library
    #[arg(long, global = true)]
    library_dir: Option<PathBuf>,

    /// Skip Libation scan/liberate before processing
    #[arg(long, global = true)]
    no_sync: bool,

    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Split every book of the library (default)
    Run,
    /// Show how a single file would be split, without writing anything
    Plan {
        /// Audio file to inspect
        file: PathBuf,
    },
    /// List the recorded state of every book
    Status {
        /// Only books in this state
        #[arg(long, value_enum)]
        state: Option<StateFilter>,
        /// Print the records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget a book's state so it is processed again
    Reset {
        /// Book id as shown by `status`
        #[arg(required_unless_present = "all")]
        book_id: Option<String>,
        /// Forget every book
        #[arg(long, conflicts_with = "book_id")]
        all: bool,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum StateFilter {
    Pending,
    Planning,
    PartInProgress,
    PartCommitted,
    Completed,
    Failed,
}

impl StateFilter {
    /// Stored state matched by this filter
    fn state(self) -> JobState {
        match self {
            StateFilter::Pending => JobState::Pending,
            StateFilter::Planning => JobState::Planning,
            StateFilter::PartInProgress => JobState::PartInProgress(1),
            StateFilter::PartCommitted => JobState::PartCommitted(1),
            StateFilter::Completed => JobState::Completed,
            StateFilter::Failed => JobState::Failed(String::new()),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(config.debug);

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Plan { file } => plan_file(&config, &file).await,
        Commands::Status { state, json } => status(&config, state, json).await,
        Commands::Reset { book_id, all } => reset(&config, book_id, all).await,
        Commands::Config => show_config(&config, cli.config.as_deref()),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {}", describe(&e));
            ExitCode::FAILURE
        }
    }
}

/// Operator-facing text of a top-level error
fn describe(e: &anyhow::Error) -> String {
    match e.downcast_ref::<SplitError>() {
        Some(inner) if e.chain().count() > 1 => format!("{}: {}", e, inner.user_message()),
        Some(inner) => inner.user_message(),
        None => format!("{:#}", e),
    }
}

/// Defaults < config file < environment < flags
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.apply_env().context("Invalid environment override")?;

    if let Some(output) = &cli.output {
        config.output_dir = output.clone();
    }
    if let Some(hours) = cli.max_hours {
        config.max_part_hours = hours;
    }
    if let Some(jobs) = cli.jobs {
        config.max_concurrent_books = jobs;
    }
    if let Some(author) = &cli.author {
        config.filter_by_author = Some(author.clone()).filter(|a| !a.trim().is_empty());
    }
    if let Some(dir) = &cli.library_dir {
        config.library_dir = Some(dir.clone());
    }
    if cli.no_sync {
        config.sync_library = false;
    }
    if cli.debug {
        config.debug = true;
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

async fn open_tracker(config: &Config) -> anyhow::Result<(Database, JobTracker)> {
    let path = config.state_db_path();
    let db = Database::new(&path)
        .await
        .with_context(|| format!("Failed to open job database {}", path.display()))?;
    if !db.quick_check().await? {
        bail!(
            "Job database {} is damaged; move it away to start over",
            path.display()
        );
    }
    let tracker = JobTracker::new(JobStore::new(db.pool().clone()));
    Ok((db, tracker))
}

/// First Ctrl+C stops after the current step, the second quits at once
fn install_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\nStopping after the current step (Ctrl+C again to quit now)...");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Quitting.");
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
    });
}

async fn run(config: Config) -> anyhow::Result<ExitCode> {
    let source = config.library_source()?;
    config
        .verify_tools()
        .await
        .context("Required tools are not available")?;

    let (db, tracker) = open_tracker(&config).await?;
    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone());

    let layout = OutputLayout::new(config.output_dir.clone(), config.per_book_subdirectory);
    let probe = FfprobeChapterProbe::new(config.ffprobe_path.clone());
    let engine = FfmpegCutter::new(config.ffmpeg_path.clone());
    let ui = ProgressUi::new();

    let result = match source {
        LibrarySource::Libation(exe) => {
            let mut libation = LibationCli::new(exe, config.state_dir())
                .with_author_filter(config.filter_by_author.clone())
                .keep_export(config.debug);
            for dir in output_folders(&config) {
                libation = libation.skipping(dir);
            }

            if config.sync_library {
                if let Err(e) = libation.sync(&cancel).await {
                    if e.is_cancellation() || e.is_fatal() {
                        return Err(e.into());
                    }
                    warn!("Library sync failed, continuing with local books: {}", e.user_message());
                }
            }

            let books = libation.books().await.context("Failed to read the Libation library")?;
            Orchestrator::new(config.run_settings(), layout, tracker, probe, engine, libation)
                .with_progress(ui.callback())
                .run(books, &cancel)
                .await
        }
        LibrarySource::Directory(dir) => {
            let library = output_folders(&config)
                .into_iter()
                .fold(DirectoryLibrary::new(dir.clone()), DirectoryLibrary::skipping);
            let books = library
                .books()
                .await
                .with_context(|| format!("Failed to scan {}", dir.display()))?;
            let books = filter_by_author(books, config.filter_by_author.as_deref());
            Orchestrator::new(config.run_settings(), layout, tracker, probe, engine, NoDownloader)
                .with_progress(ui.callback())
                .run(books, &cancel)
                .await
        }
    };

    ui.finish();
    if let Err(e) = db.close().await {
        warn!("Failed to close job database: {}", e);
    }

    let summary = result?;
    print_summary(&summary);

    Ok(if summary.has_failures() {
        ExitCode::FAILURE
    } else if summary.was_interrupted() || cancel.is_cancelled() {
        ExitCode::from(EXIT_INTERRUPTED)
    } else {
        ExitCode::SUCCESS
    })
}

/// Folders we write to, never scanned for books
fn output_folders(config: &Config) -> Vec<PathBuf> {
    std::iter::once(config.output_dir.clone())
        .chain(config.copy_to.clone())
        .collect()
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Summary");
    println!("  Completed (split):   {}", summary.completed());
    println!("  Skipped (no split):  {}", summary.skipped());
    println!("  Already processed:   {}", summary.already_processed());
    println!("  Interrupted:         {}", summary.interrupted());
    println!("  Failed:              {}", summary.failures().count());
    for (report, reason) in summary.failures() {
        println!("    - {}: {}", report.title, reason);
    }
    if summary.was_interrupted() {
        println!("Run again to resume the interrupted books.");
    }
}

async fn plan_file(config: &Config, file: &Path) -> anyhow::Result<ExitCode> {
    if !file.is_file() {
        bail!("input file does not exist: {}", file.display());
    }

    let title = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Untitled".to_string());
    let probe = FfprobeChapterProbe::new(config.ffprobe_path.clone());
    let chapters = load_chapter_table(&probe, file, &title, None)
        .await
        .with_context(|| format!("Failed to read chapters of {}", file.display()))?;
    let plan = plan(&chapters, config.max_part_duration())?;
    let extension = source_extension(file);

    println!(
        "{}: {} in {} chapter(s){}",
        title,
        HumanDuration(chapters.total_duration),
        chapters.len(),
        if chapters.synthetic { " (no usable chapter table)" } else { "" }
    );
    if !plan.is_split() {
        println!("No split needed (limit {})", HumanDuration(plan.max_part));
    }

    for part in &plan.parts {
        let first = part.chapters.first().map_or(0, |c| c.index + 1);
        let last = part.chapters.last().map_or(0, |c| c.index + 1);
        println!(
            "  {}  {} - {}  ({})  chapters {}-{}{}",
            part_file_name(&title, part.part_index, part.total_parts, &extension),
            format_ffmpeg_timestamp(part.start),
            format_ffmpeg_timestamp(part.end),
            HumanDuration(part.duration()),
            first,
            last,
            if part.oversized { "  [oversized chapter]" } else { "" }
        );
    }

    Ok(ExitCode::SUCCESS)
}

async fn status(config: &Config, state: Option<StateFilter>, json: bool) -> anyhow::Result<ExitCode> {
    let (db, tracker) = open_tracker(config).await?;
    let records = match state {
        Some(filter) => tracker.store().list_by_state(&filter.state()).await?,
        None => tracker.store().list().await?,
    };
    db.close().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(ExitCode::SUCCESS);
    }

    if records.is_empty() {
        println!("No books recorded yet.");
        return Ok(ExitCode::SUCCESS);
    }

    for record in &records {
        let parts = if record.total_parts > 0 {
            format!("{}/{} parts", record.committed_parts.len(), record.total_parts)
        } else {
            "not planned".to_string()
        };
        println!(
            "{:<24} {:<20} {:<14} {}  {}",
            record.book_id,
            record.state.as_str(),
            parts,
            record.updated_at.format("%Y-%m-%d %H:%M"),
            record.title
        );
        if let Some(reason) = record.failure() {
            println!("{:<24} {}", "", reason);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn reset(config: &Config, book_id: Option<String>, all: bool) -> anyhow::Result<ExitCode> {
    let (db, tracker) = open_tracker(config).await?;

    if all {
        let removed = tracker.reset_all().await?;
        println!("Forgot {} book(s)", removed);
    } else if let Some(book_id) = book_id {
        if tracker.reset(&book_id).await? {
            println!("Forgot {}", book_id);
        } else {
            println!("No record for {}", book_id);
        }
    }

    db.close().await?;
    Ok(ExitCode::SUCCESS)
}

fn show_config(config: &Config, path: Option<&Path>) -> anyhow::Result<ExitCode> {
    let location = path
        .map(Path::to_path_buf)
        .or_else(Config::default_path)
        .map_or_else(|| "(none)".to_string(), |p| p.display().to_string());
    println!("# Config file: {}", location);
    print!("{}", config.to_toml()?);
    Ok(ExitCode::SUCCESS)
}

/// Overall books bar plus a bar for the parts of the current book
struct ProgressUi {
    multi: MultiProgress,
    books: ProgressBar,
    parts: ProgressBar,
}

impl ProgressUi {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let books_style = ProgressStyle::with_template("{prefix:>6} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        let parts_style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {bar:30.green/white} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());

        let books = multi.add(ProgressBar::new(0));
        books.set_style(books_style);
        books.set_prefix("Books");

        let parts = multi.add(ProgressBar::new(0));
        parts.set_style(parts_style);
        parts.enable_steady_tick(Duration::from_millis(120));

        Self { multi, books, parts }
    }

    fn callback(&self) -> ProgressCallback {
        let multi = self.multi.clone();
        let books = self.books.clone();
        let parts = self.parts.clone();

        Arc::new(move |event: ProgressEvent| match event {
            ProgressEvent::RunStarted { total_books } => {
                books.set_length(total_books as u64);
            }
            ProgressEvent::BookStarted { title, .. } => {
                books.set_message(title);
                parts.reset();
                parts.set_length(0);
                parts.set_message("checking");
            }
            ProgressEvent::Downloading { title, .. } => {
                parts.set_message(format!("downloading {}", title));
            }
            ProgressEvent::BookPlanned {
                total_parts,
                resume_at,
                oversized_parts,
                total_duration,
                ..
            } => {
                parts.set_length(u64::from(total_parts) * PART_TICKS);
                parts.set_position(u64::from(resume_at.saturating_sub(1)) * PART_TICKS);
                if resume_at > 1 && resume_at <= total_parts {
                    let _ = multi.println(format!("  resuming at part {} of {}", resume_at, total_parts));
                }
                if oversized_parts > 0 {
                    let _ = multi.println(format!(
                        "  {} part(s) exceed the limit (single long chapters)",
                        oversized_parts
                    ));
                }
                parts.set_message(format!("{} in {} part(s)", HumanDuration(total_duration), total_parts));
            }
            ProgressEvent::PartStarted {
                part_index,
                total_parts,
                duration,
                ..
            } => {
                parts.set_message(format!(
                    "part {}/{} ({})",
                    part_index,
                    total_parts,
                    HumanDuration(duration)
                ));
            }
            ProgressEvent::PartProgress {
                part_index,
                fraction,
                ..
            } => {
                let done = u64::from(part_index.saturating_sub(1)) * PART_TICKS;
                parts.set_position(done + (f64::from(fraction.clamp(0.0, 1.0)) * PART_TICKS as f64) as u64);
            }
            ProgressEvent::PartRetry {
                part_index,
                attempt,
                max_attempts,
                reason,
                ..
            } => {
                let _ = multi.println(format!(
                    "  part {} failed, retrying ({}/{}): {}",
                    part_index, attempt, max_attempts, reason
                ));
            }
            ProgressEvent::PartCommitted { part_index, .. } => {
                parts.set_position(u64::from(part_index) * PART_TICKS);
            }
            ProgressEvent::BookFinished { title, outcome, .. } => {
                let _ = multi.println(outcome.display_string(&title));
                books.inc(1);
            }
            ProgressEvent::RunFinished { .. } => {
                info!("All books handled");
            }
        })
    }

    fn finish(&self) {
        self.parts.finish_and_clear();
        self.books.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_prefers_user_message() {
        let missing = SplitError::ToolNotFound {
            tool: "ffmpeg".to_string(),
            path: PathBuf::from("/opt/ffmpeg"),
        };
        let expected = missing.user_message();
        let err = anyhow::Error::new(missing);
        assert_eq!(describe(&err), expected);

        let wrapped = err.context("Failed to check tools");
        assert!(describe(&wrapped).starts_with("Failed to check tools: "));

        let plain = anyhow::anyhow!("boom");
        assert_eq!(describe(&plain), "boom");
    }

    #[test]
    fn test_status_filter_parses_kebab_case() {
        let cli = Cli::try_parse_from(["librisplit", "status", "--state", "part-committed"]).unwrap();
        match cli.command {
            Some(Commands::Status { state, .. }) => {
                assert_eq!(state.map(StateFilter::state), Some(JobState::PartCommitted(1)));
            }
            _ => panic!("expected status"),
        }
    }
}
