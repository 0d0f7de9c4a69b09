//! # Story Trim CLI (`storytrim`)
//!
//! ## Usage
//!
//! ```bash
//! storytrim --config ./config/storytrim.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `storytrim init` | Create the SQLite database, run migrations, seed prompts |
//! | `storytrim segment <file>` | Show how a text file would be split into chapters |
//! | `storytrim import <file>` | Import a book |
//! | `storytrim books` / `chapters <book>` / `prompts` | List stored data |
//! | `storytrim trim <chapter>` | Stream a chapter trim to stdout |
//! | `storytrim trim-text <file>` | Stream a trim of arbitrary text |
//! | `storytrim batch <book>` | Queue a whole-book trim |
//! | `storytrim task <id>` | Show a batch task and its chapters |
//! | `storytrim status <book>` | Show whether a book is ready under a prompt |
//! | `storytrim delete <book>` | Delete a book and its chapters |

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use story_trim::app::StoryTrim;
use story_trim::config::{self, Config};
use story_trim::progress::{BatchProgressEvent, BatchProgressReporter, ProgressMode};
use story_trim::stream::StreamSource;
use story_trim_core::models::{PromptKind, TaskItemStatus, UserContext};
use story_trim_core::segment::evaluate;

/// Story Trim: LLM condensation of long-form fiction, chapter by chapter.
#[derive(Parser)]
#[command(name = "storytrim", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/storytrim.toml`. A missing file is only
    /// tolerated by `segment`, which then uses the built-in rules.
    #[arg(long, global = true, default_value = "./config/storytrim.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and seed the built-in prompts.
    ///
    /// Idempotent: running it again leaves existing rows alone.
    Init,

    /// Split a text file into chapters without storing anything.
    Segment {
        file: PathBuf,

        /// Also print every rule's match count and score.
        #[arg(long)]
        explain: bool,
    },

    /// Import a plain-text book.
    Import {
        file: PathBuf,

        /// Book title. Defaults to the file stem.
        #[arg(long)]
        title: Option<String>,

        /// Owner user id. Omit for an anonymous import.
        #[arg(long)]
        user: Option<i64>,
    },

    /// List books.
    Books {
        #[arg(long)]
        user: Option<i64>,
    },

    /// List the chapters of a book.
    Chapters { book_id: i64 },

    /// List prompts.
    Prompts,

    /// Trim one chapter, streaming the result to stdout.
    Trim {
        chapter_id: i64,

        /// Prompt id. Defaults to the default trim prompt.
        #[arg(long)]
        prompt: Option<i64>,

        #[arg(long)]
        user: Option<i64>,
    },

    /// Trim the contents of a file without touching the cache.
    TrimText {
        file: PathBuf,

        #[arg(long)]
        prompt: Option<i64>,
    },

    /// Queue a whole-book trim and print the task id.
    Batch {
        book_id: i64,

        #[arg(long)]
        prompt: Option<i64>,

        #[arg(long)]
        user: Option<i64>,

        /// Wait for the task to finish, reporting progress on stderr.
        #[arg(long)]
        wait: bool,

        /// Progress output while waiting. Defaults to `human` on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show a batch task and its per-chapter items.
    Task { task_id: String },

    /// Show how much of a book a user has trimmed and whether it is ready.
    Status {
        book_id: i64,

        #[arg(long)]
        prompt: Option<i64>,

        #[arg(long)]
        user: Option<i64>,
    },

    /// Delete a book and its chapters. Cached trims and memory are kept.
    Delete { book_id: i64 },
}

fn user_context(user: Option<i64>) -> UserContext {
    user.map(UserContext::user).unwrap_or_default()
}

fn read_text(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

async fn resolve_prompt(app: &StoryTrim, prompt: Option<i64>) -> anyhow::Result<i64> {
    if let Some(id) = prompt {
        return Ok(id);
    }
    app.stores()
        .prompts
        .default_prompt(PromptKind::Trim)
        .await?
        .map(|p| p.id)
        .context("No default trim prompt; run `storytrim init` first")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Segmentation is pure; it works without a config file.
    if let Commands::Segment { file, explain } = &cli.command {
        let cfg = config::load_config(&cli.config).unwrap_or_else(|_| Config::default());
        return run_segment(&cfg, file, *explain);
    }

    let cfg = config::load_config(&cli.config)?;

    let app = StoryTrim::open(&cfg).await?;
    let result = run(&app, cli.command).await;
    app.shutdown().await;
    result
}

fn run_segment(cfg: &Config, file: &Path, explain: bool) -> anyhow::Result<()> {
    let text = read_text(file)?;
    let rules = cfg.segmentation.effective_rules();
    let seg = story_trim_core::segment::segment(&text, &rules);

    println!("rule: {}", seg.rule.as_deref().unwrap_or("(none)"));
    if let Some(preface) = &seg.preface {
        println!("preface: {} chars", preface.chars().count());
    }
    for chapter in &seg.chapters {
        println!(
            "{:>5}  {:>8} chars  {}",
            chapter.index,
            chapter.body.chars().count(),
            chapter.title
        );
    }

    if explain {
        println!();
        for report in evaluate(&text, &rules) {
            let score = report
                .score
                .map(|s| format!("{:.2}", s))
                .unwrap_or_else(|| "-".to_string());
            println!("{:<16} matches={:<6} score={}", report.name, report.matches, score);
        }
    }
    Ok(())
}

async fn run(app: &StoryTrim, command: Commands) -> anyhow::Result<()> {
    match command {
        // Opening the app already migrated and seeded.
        Commands::Init => println!("Database initialized successfully."),
        Commands::Segment { .. } => {}
        Commands::Import { file, title, user } => {
            let text = read_text(&file)?;
            let title = title.unwrap_or_else(|| {
                file.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "Untitled".to_string())
            });
            let book = app.import_book(user_context(user), &title, &text).await?;
            println!(
                "Imported book {} \"{}\" ({} chapters)",
                book.id, book.title, book.total_chapters
            );
        }
        Commands::Books { user } => {
            for book in app.stores().content.list_books(user).await? {
                println!(
                    "{:>6}  {:>5} chapters  {}",
                    book.id, book.total_chapters, book.title
                );
            }
        }
        Commands::Chapters { book_id } => {
            for chapter in app.stores().content.list_chapters(book_id).await? {
                println!("{:>6}  #{:<5} {}", chapter.id, chapter.index, chapter.title);
            }
        }
        Commands::Prompts => {
            for prompt in app.stores().prompts.list_prompts().await? {
                println!(
                    "{:>4}  {:<8} v{:<3} {:<12}{}  {}",
                    prompt.id,
                    prompt.kind.as_str(),
                    prompt.version,
                    prompt.name,
                    if prompt.is_default { "*" } else { " " },
                    prompt.description
                );
            }
        }
        Commands::Trim {
            chapter_id,
            prompt,
            user,
        } => {
            let prompt_id = resolve_prompt(app, prompt).await?;
            let cancel = CancellationToken::new();
            let stream = app
                .stream_trim(user_context(user), chapter_id, prompt_id, cancel.clone())
                .await?;
            print_stream(stream, cancel).await?;
        }
        Commands::TrimText { file, prompt } => {
            let text = read_text(&file)?;
            let prompt_id = resolve_prompt(app, prompt).await?;
            let cancel = CancellationToken::new();
            let stream = app.stream_trim_text(&text, prompt_id, cancel.clone()).await?;
            print_stream(stream, cancel).await?;
        }
        Commands::Batch {
            book_id,
            prompt,
            user,
            wait,
            progress,
        } => {
            let prompt_id = resolve_prompt(app, prompt).await?;
            let task_id = app
                .submit_batch(user_context(user), book_id, prompt_id)
                .await?;
            println!("{}", task_id);
            if wait {
                let reporter = progress
                    .unwrap_or_else(ProgressMode::default_for_tty)
                    .reporter();
                wait_for_task(app, &task_id, reporter.as_ref()).await?;
            }
        }
        Commands::Task { task_id } => {
            let task = app.get_task(&task_id).await?;
            println!(
                "task {}  {}  {}%  book {}  prompt {}",
                task.id,
                task.status.as_str(),
                task.progress,
                task.book_id,
                task.prompt_id
            );
            if let Some(ms) = task.elapsed_ms {
                println!("elapsed: {} ms", ms);
            }
            if let Some(error) = &task.error {
                println!("errors:\n{}", error);
            }
            for item in app.get_task_items(&task_id).await? {
                println!(
                    "  #{:<5} {:<10} {}",
                    item.chapter_index,
                    item.status.as_str(),
                    item.error.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Status {
            book_id,
            prompt,
            user,
        } => {
            let prompt_id = resolve_prompt(app, prompt).await?;
            let status = app
                .book_trim_status(user_context(user), book_id, prompt_id)
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Delete { book_id } => {
            app.delete_book(book_id).await?;
            println!("Deleted book {}", book_id);
        }
    }
    Ok(())
}

/// Copy increments to stdout until the stream ends. Ctrl-C cancels the
/// upstream call.
async fn print_stream(
    mut stream: story_trim::stream::TrimStream,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let source = match stream.source {
        StreamSource::Hit => "cache",
        StreamSource::Miss => "model",
    };
    tracing::info!(source, level = %stream.level, "streaming trim");

    let mut out = std::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                anyhow::bail!("interrupted");
            }
            next = stream.receiver.recv() => match next {
                Some(Ok(piece)) => {
                    out.write_all(piece.as_bytes())?;
                    out.flush()?;
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
    }
    writeln!(out)?;
    Ok(())
}

async fn wait_for_task(
    app: &StoryTrim,
    task_id: &str,
    reporter: &dyn BatchProgressReporter,
) -> anyhow::Result<()> {
    let mut last_progress = -1;
    loop {
        let task = app.get_task(task_id).await?;
        let items = app.get_task_items(task_id).await?;
        let total = items.len() as u64;
        let count = |status: TaskItemStatus| items.iter().filter(|i| i.status == status).count() as u64;

        if task.status.is_terminal() {
            reporter.report(BatchProgressEvent::Finished {
                task_id: task.id.clone(),
                status: task.status.as_str().to_string(),
                failed: count(TaskItemStatus::Failed),
                total,
            });
            if let Some(error) = &task.error {
                eprintln!("{}", error);
            }
            return Ok(());
        }

        if items.is_empty() {
            if last_progress < 0 {
                reporter.report(BatchProgressEvent::Queued {
                    task_id: task.id.clone(),
                });
                last_progress = 0;
            }
        } else if task.progress != last_progress {
            last_progress = task.progress;
            reporter.report(BatchProgressEvent::Running {
                task_id: task.id.clone(),
                progress: task.progress,
                done: count(TaskItemStatus::Done) + count(TaskItemStatus::Failed),
                total,
            });
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
