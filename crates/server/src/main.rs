#![forbid(unsafe_code)]

//! `engram` — a per-project knowledge server that keeps living markdown docs
//! in sync with a repository's evolution through bounded fold-agent
//! dispatches.

mod bootstrap;
mod briefing;
mod buffer;
mod dispatch;
mod dispatcher;
mod error;
mod migrate;
mod server;
mod templates;
mod watcher;


use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::ServerError;
use engram_core::Config;
use engram_fold::{ActiveChunkLock, FoldError, engram_dir};
use engram_storage::StateStore;

fn usage() -> &'static str {
    "engram — persistent knowledge folding for a project\n\n\
USAGE:\n\
  engram <command> [--project-root DIR] [options]\n\n\
COMMANDS:\n\
  init                              Create .engram/, config template, living docs\n\
  build-queue [--start-date D]      Run adapters and write the chronological queue\n\
              [--no-refresh-issues]\n\
  next-chunk                        Build the next chunk input + prompt files\n\
  clear-active-chunk                Remove the active-chunk lock\n\
  lint                              Validate living docs against schema rules\n\
  run                               Run the knowledge server (foreground)\n\
  status                            Show buffer fill, dispatches, markers\n\
  seed [--from-date D]              Bootstrap living docs from a repo snapshot\n\
  fold --from D                     Forward fold from a date to today\n\
  migrate [--fold-from D]           Migrate legacy docs to stable-ID format\n\n\
Dates are strict YYYY-MM-DD.\n"
}

#[derive(Debug)]
struct Args {
    command: String,
    project_root: PathBuf,
    start_date: Option<String>,
    from_date: Option<String>,
    fold_from: Option<String>,
    refresh_issues: bool,
}

fn parse_args(argv: &[String]) -> Result<Args, String> {
    let Some(command) = argv.first() else {
        return Err(usage().to_string());
    };
    let mut args = Args {
        command: command.clone(),
        project_root: PathBuf::from("."),
        start_date: None,
        from_date: None,
        fold_from: None,
        refresh_issues: true,
    };

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--project-root" => {
                i += 1;
                let value = argv.get(i).ok_or("--project-root requires a value")?;
                args.project_root = PathBuf::from(value);
            }
            "--start-date" => {
                i += 1;
                args.start_date = Some(
                    argv.get(i)
                        .ok_or("--start-date requires a value")?
                        .clone(),
                );
            }
            "--from-date" => {
                i += 1;
                args.from_date = Some(
                    argv.get(i)
                        .ok_or("--from-date requires a value")?
                        .clone(),
                );
            }
            "--from" => {
                i += 1;
                args.from_date = Some(argv.get(i).ok_or("--from requires a value")?.clone());
            }
            "--fold-from" => {
                i += 1;
                args.fold_from = Some(
                    argv.get(i)
                        .ok_or("--fold-from requires a value")?
                        .clone(),
                );
            }
            "--no-refresh-issues" => args.refresh_issues = false,
            "--help" | "-h" => return Err(usage().to_string()),
            other => return Err(format!("unknown argument: {other}\n\n{}", usage())),
        }
        i += 1;
    }

    if !args.project_root.is_dir() {
        return Err(format!(
            "project root is not a directory: {}",
            args.project_root.display()
        ));
    }
    args.project_root = args
        .project_root
        .canonicalize()
        .map_err(|err| format!("cannot resolve project root: {err}"))?;
    Ok(args)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let code = match run_command(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("engram: {err}");
            1
        }
    };
    std::process::exit(code);
}

fn run_command(args: &Args) -> Result<i32, ServerError> {
    match args.command.as_str() {
        "init" => cmd_init(&args.project_root),
        "build-queue" => cmd_build_queue(args),
        "next-chunk" => cmd_next_chunk(&args.project_root),
        "clear-active-chunk" => cmd_clear_active_chunk(&args.project_root),
        "lint" => cmd_lint(&args.project_root),
        "run" => {
            init_tracing();
            let config = Config::load(&args.project_root)?;
            println!("Starting engram server for {}...", args.project_root.display());
            server::run_server(&config, &args.project_root)?;
            Ok(0)
        }
        "status" => cmd_status(&args.project_root),
        "seed" => {
            init_tracing();
            let config = Config::load(&args.project_root)?;
            bootstrap::seed(&config, &args.project_root, args.from_date.as_deref())?;
            println!("Seed complete.");
            Ok(0)
        }
        "fold" => {
            init_tracing();
            let Some(from_day) = args.from_date.as_deref() else {
                eprintln!("fold requires --from YYYY-MM-DD");
                return Ok(2);
            };
            let config = Config::load(&args.project_root)?;
            let mut store = StateStore::open(engram_dir(&args.project_root))?;
            let chunks = bootstrap::forward_fold(&config, &args.project_root, &mut store, from_day)?;
            println!("Forward fold complete ({chunks} chunks).");
            Ok(0)
        }
        "migrate" => cmd_migrate(args),
        other => {
            eprintln!("unknown command: {other}\n\n{}", usage());
            Ok(2)
        }
    }
}

fn cmd_init(project_root: &Path) -> Result<i32, ServerError> {
    let engram = engram_dir(project_root);
    if engram.exists() {
        eprintln!(".engram/ already exists at {}", engram.display());
        return Ok(1);
    }
    std::fs::create_dir_all(&engram)?;
    let config_path = engram.join("config.yaml");
    std::fs::write(&config_path, Config::template())?;
    println!("Created {}", config_path.display());

    // Load through the standard path so the template is validated.
    let config = Config::load(project_root)?;
    bootstrap::ensure_living_docs(&config, project_root)?;
    for (_, path) in config.doc_paths(project_root).living() {
        println!("Created {}", path.display());
    }
    for (_, path) in config.doc_paths(project_root).graveyards() {
        println!("Created {}", path.display());
    }
    StateStore::open(&engram)?;

    println!("\nEngram initialized. Edit .engram/config.yaml to customize paths.");
    Ok(0)
}

fn cmd_build_queue(args: &Args) -> Result<i32, ServerError> {
    let config = Config::load(&args.project_root)?;
    let store = StateStore::open(engram_dir(&args.project_root))?;

    // Explicit flag > persisted fold-from marker > full queue.
    let marker = store.fold_from()?;
    let effective_start = args.start_date.clone().or(marker);

    if args.refresh_issues {
        let (ok, message) = engram_fold::sources::refresh_issue_snapshots(&config, &args.project_root);
        if ok {
            println!("Issue refresh: {message}");
        } else {
            eprintln!(
                "Issue refresh failed: {message}. \
                 Re-run with --no-refresh-issues to use local snapshots."
            );
            return Ok(1);
        }
    }

    let entries = engram_fold::build_queue(&config, &args.project_root, effective_start.as_deref())?;

    let doc_count = entries.iter().filter(|e| e.kind == "doc").count();
    let revisit_count = entries
        .iter()
        .filter(|e| e.kind == "doc" && e.pass == "revisit")
        .count();
    let issue_count = entries.iter().filter(|e| e.kind == "issue").count();
    let session_count = entries.iter().filter(|e| e.kind == "prompts").count();

    println!("Built queue: {} entries", entries.len());
    println!("  Docs: {doc_count} ({revisit_count} revisits)");
    println!("  Issues: {issue_count}");
    println!("  Sessions: {session_count}");
    if let (Some(first), Some(last)) = (entries.first(), entries.last()) {
        println!("  Date range: {} to {}", first.day(), last.day());
    }
    Ok(0)
}

fn cmd_next_chunk(project_root: &Path) -> Result<i32, ServerError> {
    let config = Config::load(project_root)?;
    let mut store = StateStore::open(engram_dir(project_root))?;
    let fold_from = store.fold_from()?;

    let result = match engram_fold::next_chunk(&config, &mut store, project_root, fold_from.as_deref())
    {
        Ok(result) => result,
        Err(err @ FoldError::LockHeld { .. }) => {
            eprintln!("{err}");
            return Ok(1);
        }
        Err(FoldError::QueueMissing) => {
            eprintln!("{}", FoldError::QueueMissing);
            return Ok(1);
        }
        Err(FoldError::QueueEmpty) => {
            println!("{}", FoldError::QueueEmpty);
            return Ok(0);
        }
        Err(err) => return Err(err.into()),
    };

    println!("Chunk {}:", result.chunk_id);
    println!("  Type: {}", result.chunk_type.as_str());
    println!("  Living docs: {} chars", result.living_docs_chars);
    println!("  Budget: {} chars", result.budget);
    if result.chunk_type == engram_fold::ChunkType::Fold {
        println!("  Items: {}", result.items_count);
        println!("  Chunk chars: {}", result.chunk_chars);
        if let Some(range) = &result.date_range {
            println!("  Date range: {range}");
        }
        for (category, ids) in &result.pre_assigned {
            println!("  Pre-assigned {category}: {}", ids.join(", "));
        }
    } else {
        println!("  Drift entries: {}", result.drift_entry_count);
        println!("  ** Drift triage round — no queue items consumed **");
    }
    println!("  Written: {}", result.input_path.display());
    println!("  Prompt: {}", result.prompt_path.display());
    println!("  Remaining in queue: {}", result.remaining_queue);
    Ok(0)
}

fn cmd_clear_active_chunk(project_root: &Path) -> Result<i32, ServerError> {
    if ActiveChunkLock::clear(&engram_dir(project_root))? {
        println!("Cleared active chunk lock.");
    } else {
        println!("No active chunk lock present.");
    }
    Ok(0)
}

fn cmd_lint(project_root: &Path) -> Result<i32, ServerError> {
    let config = Config::load(project_root)?;
    let doc_paths = config.doc_paths(project_root);
    let living = doc_paths.read_living();
    let graveyards = doc_paths.read_graveyards();
    let result = engram_core::linter::lint(&living, &graveyards);

    if result.passed() {
        println!("Lint: PASS (0 violations)");
        Ok(0)
    } else {
        println!("Lint: FAIL ({} violations)", result.violations.len());
        for violation in &result.violations {
            println!("  {violation}");
        }
        Ok(1)
    }
}

fn cmd_status(project_root: &Path) -> Result<i32, ServerError> {
    let engram = engram_dir(project_root);
    if !engram.join(engram_storage::DB_FILE).exists() {
        eprintln!("No database found. Run 'engram init' first.");
        return Ok(1);
    }
    let config = Config::load(project_root)?;
    let status = server::get_status(&config, project_root)?;

    println!("Buffer:");
    println!("  Items: {}", status.fill.item_count);
    println!(
        "  Chars: {} / {} ({:.1}%)",
        status.fill.buffer_chars, status.fill.dispatch_threshold, status.fill.fill_pct
    );
    println!("  Living docs: {} chars", status.fill.living_docs_chars);
    println!("  Chunk budget: {} chars", status.fill.budget);

    println!("\nPending items: {}", status.pending_items);
    println!("Queue drained: {}", status.queue_empty);
    match &status.state.fold_from {
        Some(day) => println!("Fold-from marker: {day}"),
        None => println!("Fold-from marker: (none)"),
    }
    println!("L0 stale: {}", status.state.l0_stale);

    match &status.last_dispatch {
        Some(last) => {
            println!("\nLast dispatch:");
            println!("  Chunk: {}", last.chunk_id);
            println!("  Type: {}", last.chunk_type);
            println!("  State: {}", last.state.as_str());
            println!("  Retries: {}", last.retry_count);
            println!("  Time: {}", last.updated_at);
            if let Some(error) = &last.error {
                println!("  Error: {error}");
            }
        }
        None => println!("\nNo dispatches yet."),
    }

    if !status.recent_dispatches.is_empty() {
        println!("\nRecent dispatches ({}):", status.recent_dispatches.len());
        for dispatch in &status.recent_dispatches {
            println!(
                "  #{} {} (retries={}) {}",
                dispatch.chunk_id,
                dispatch.state.as_str(),
                dispatch.retry_count,
                dispatch.updated_at
            );
        }
    }

    if let Some(poll_time) = &status.state.last_poll_time {
        println!("\nLast poll: {poll_time}");
    }
    if let Some(dispatch_time) = &status.state.last_dispatch_time {
        println!("Last dispatch: {dispatch_time}");
    }
    Ok(0)
}

fn cmd_migrate(args: &Args) -> Result<i32, ServerError> {
    let config = Config::load(&args.project_root)?;
    println!("Starting migration to stable-ID format...");
    let report = migrate::migrate(&config, &args.project_root, args.fold_from.as_deref())?;

    println!("Backfilled IDs: {}", report.backfilled);
    println!("Workflows extracted: {}", report.workflows_extracted);
    println!("Entries compacted to graveyard: {}", report.compacted);
    let counters: Vec<String> = report
        .counters
        .iter()
        .map(|(category, next)| format!("{category}={next}"))
        .collect();
    println!("Counter state: {}", counters.join(", "));
    if let Some(day) = &args.fold_from {
        println!("Fold continuation marker set: {day}");
    }

    if report.lint.passed() {
        println!("Validation: PASS (0 violations)");
        println!("Migration complete.");
        Ok(0)
    } else {
        println!("Validation: FAIL ({} violations)", report.lint.violations.len());
        for violation in &report.lint.violations {
            println!("  {violation}");
        }
        println!("Migration complete with validation warnings.");
        Ok(1)
    }
}
