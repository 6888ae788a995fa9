//! projsync command-line tool.
//!
//! Runs sync attempts against a workspace, inspects the persisted sync lock,
//! walks the user through conflict resolution and completes the merge.

mod progress;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::Cell;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use projsync_core::conflict::{ConflictResolver, ConflictedFile, Merger, ResolutionChoice};
use projsync_core::lock::LockState;
use projsync_core::models::{NoopProgress, SyncOutcome, SyncReport};
use projsync_core::{get_working_copy_state, GitClient, MergeCompletion, ProjsyncConfig, SyncEngine};

use progress::SpinnerSink;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// projsync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "projsync",
    version,
    about = "Keep a project working copy in sync with a shared Git remote"
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults to ./projsync.toml,
    /// then the user config directory; built-in defaults apply when neither
    /// exists.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Workspace directory (a Git working copy).
    #[arg(short = 'C', long, global = true, default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "projsync.toml")]
        output: PathBuf,
    },

    /// Validate the configuration file.
    Validate,

    /// Show uncommitted changes in the workspace.
    Status,

    /// Commit local changes, fetch, and fast-forward or report conflicts.
    Sync {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the state of the workspace sync lock.
    LockStatus {
        /// Print the status as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Remove the workspace sync lock regardless of who holds it.
    Unlock,

    /// List conflicts between the local branch and the last fetched remote.
    Conflicts {
        /// Show a three-way merge preview for each conflict.
        #[arg(long)]
        preview: bool,

        /// Print the conflicts as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Resolve one conflicted path in the working directory.
    Resolve {
        /// Path of the conflicted file, relative to the workspace.
        path: String,

        /// Which side to keep.
        #[arg(long, value_enum)]
        accept: Accept,
    },

    /// Commit the resolved conflicts as a merge and push.
    Complete,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Accept {
    /// Keep the local version.
    Ours,
    /// Keep the remote version.
    Theirs,
    /// Delete the file.
    Delete,
    /// Keep the automatic three-way merge; refused when it has conflicts.
    Merged,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let command = match cli.command {
        Commands::Init { output } => {
            init_logging("warn");
            return cmd_init(&output);
        }
        command => command,
    };

    let config_path = locate_config(cli.config.as_deref());
    let config = load_config(config_path.as_deref())?;
    init_logging(&config.sync.log_level);
    debug!(
        config = ?config_path,
        dir = %cli.dir.display(),
        "configuration loaded"
    );

    let dir = cli.dir.as_path();
    match command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&config, config_path.as_deref()),
        Commands::Status => cmd_status(dir),
        Commands::Sync { json } => cmd_sync(config, dir, json).await,
        Commands::LockStatus { json } => cmd_lock_status(config, dir, json),
        Commands::Unlock => cmd_unlock(config, dir),
        Commands::Conflicts { preview, json } => cmd_conflicts(config, dir, preview, json),
        Commands::Resolve { path, accept } => cmd_resolve(config, dir, &path, accept),
        Commands::Complete => cmd_complete(config, dir).await,
    }
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn locate_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from("projsync.toml");
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("projsync").join("config.toml"))
        .filter(|path| path.exists())
}

fn load_config(path: Option<&Path>) -> Result<ProjsyncConfig> {
    let mut config = match path {
        Some(path) => {
            ProjsyncConfig::load_from_file(path).context("failed to load configuration file")?
        }
        None => ProjsyncConfig::default(),
    };
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, ProjsyncConfig::default_template())
        .context("failed to write config file")?;

    println!("{}", style::success(&format!("Configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Edit the remote, branch and author settings");
    println!("  2. Export the password variable named by credentials.password_env");
    println!("  3. Validate with: projsync validate --config {}", output.display());
    Ok(())
}

fn cmd_validate(config: &ProjsyncConfig, path: Option<&Path>) -> Result<()> {
    let source = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "built-in defaults".into());

    println!();
    println!("{}", style::header("Configuration"));
    println!("  Source       {}", source);
    println!("  Remote       {}", config.sync.remote);
    println!(
        "  Branch       {}",
        config.sync.branch.as_deref().unwrap_or("(checked-out branch)")
    );
    println!("  Lock file    {}", config.lock.file_name);
    println!("  Stale after  {}s", config.lock.stale_after_secs);
    println!(
        "  Probe        {}",
        if config.connectivity.enabled {
            format!("enabled ({}s timeout)", config.connectivity.timeout_secs)
        } else {
            "disabled".to_string()
        }
    );
    println!("  Author       {} <{}>", config.author.name, config.author.email);
    match config.credentials() {
        Ok(c) if c.username.is_empty() => println!("  Credentials  anonymous"),
        Ok(c) => println!("  Credentials  {} (password set)", c.username),
        Err(e) => println!("  Credentials  {}", style::warn(&e.to_string())),
    }
    println!();
    println!("{}", style::success("Configuration is valid"));
    Ok(())
}

fn cmd_status(dir: &Path) -> Result<()> {
    let repo = GitClient::new(dir).context("failed to open workspace")?;
    let state = get_working_copy_state(&repo).context("failed to read working copy status")?;

    if !state.is_dirty {
        println!("{}", style::success("Working copy clean"));
        return Ok(());
    }

    let mut table = style::table(vec!["File", "Change", "Staged"]);
    for entry in state.changed() {
        let change = if entry.is_new() {
            "new"
        } else if entry.is_deleted() {
            "deleted"
        } else {
            "modified"
        };
        table.add_row(vec![
            Cell::new(&entry.path),
            Cell::new(change),
            Cell::new(if entry.has_staged_change() { "yes" } else { "no" }),
        ]);
    }
    println!("{}", table);
    Ok(())
}

async fn cmd_sync(config: ProjsyncConfig, dir: &Path, json: bool) -> Result<()> {
    let credentials = config.credentials().context("failed to resolve credentials")?;
    let author = config.author();
    let engine = SyncEngine::from_config(config).context("failed to set up sync engine")?;

    let result = if json {
        engine
            .sync_changes(dir, &credentials, &author, &NoopProgress)
            .await
    } else {
        let sink = SpinnerSink::new();
        let result = engine.sync_changes(dir, &credentials, &author, &sink).await;
        sink.finish();
        result
    };
    let report = result.context("sync failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    print_sync_report(&report);
    Ok(())
}

fn print_sync_report(report: &SyncReport) {
    if let Some(sha) = &report.committed {
        println!("{}", style::dim(&format!("Committed local changes as {}", style::short_sha(sha))));
    }

    let line = match report.outcome {
        SyncOutcome::AlreadySyncing => style::warn("Another sync is running; nothing done"),
        SyncOutcome::FirstPublish => style::success("Published branch to the remote"),
        SyncOutcome::AlreadyInSync => style::success("Already in sync"),
        SyncOutcome::FastForwarded => style::success("Fast-forwarded and pushed"),
        SyncOutcome::DivergedWithoutConflicts => style::warn(
            "Histories diverged without conflicts; run `projsync complete` to merge",
        ),
        SyncOutcome::ConflictsReported => style::warn("Conflicts need resolution"),
    };
    println!("{}", line);

    if let Some(conflicts) = &report.conflicts {
        println!();
        print_conflict_table(conflicts);
        println!();
        println!("Resolve each file with `projsync resolve <path> --accept ours|theirs|delete`");
        println!("or edit it directly, then run `projsync complete`.");
    }
}

fn cmd_lock_status(config: ProjsyncConfig, dir: &Path, json: bool) -> Result<()> {
    let engine = SyncEngine::from_config(config).context("failed to set up sync engine")?;
    let status = engine.lock_status(dir);

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let state = match status.state {
        LockState::Absent => style::lock_free(),
        other => style::lock_held(&other.to_string()),
    };
    println!();
    println!("{}", style::header("Sync Lock"));
    println!("  State      {}", state);
    if status.state == LockState::Absent {
        println!();
        return Ok(());
    }

    let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "—".to_string())
    };
    println!(
        "  Phase      {}",
        status
            .phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "—".to_string())
    );
    if let Some(progress) = &status.progress {
        println!(
            "  Progress   {}/{} {}",
            progress.current, progress.total, progress.description
        );
    }
    println!("  Acquired   {}", fmt_time(status.acquired_at));
    println!("  Heartbeat  {}", fmt_time(status.last_heartbeat));
    println!("  Phase set  {}", fmt_time(status.phase_changed_at));
    if status.state == LockState::Stale {
        println!();
        println!("{}", style::warn("Lock is stale; the next sync will take it over"));
    }
    println!();
    Ok(())
}

fn cmd_unlock(config: ProjsyncConfig, dir: &Path) -> Result<()> {
    let engine = SyncEngine::from_config(config).context("failed to set up sync engine")?;
    let removed = engine
        .lock_for(dir)
        .force_release()
        .context("failed to remove lock file")?;
    if removed {
        println!("{}", style::success("Sync lock removed"));
    } else {
        println!("{}", style::dim("No sync lock present"));
    }
    Ok(())
}

fn pending_conflicts(config: ProjsyncConfig, dir: &Path) -> Result<Vec<ConflictedFile>> {
    let engine = SyncEngine::from_config(config).context("failed to set up sync engine")?;
    engine
        .pending_conflicts(dir)
        .context("failed to compute pending conflicts")
}

fn print_conflict_table(conflicts: &[ConflictedFile]) {
    println!("{}", style::header(&format!("Conflicts ({})", conflicts.len())));
    let mut table = style::table(vec!["File", "Type", "Local", "Remote"]);
    for c in conflicts {
        let local = if c.ours_deleted() {
            "deleted"
        } else if c.is_new {
            "added"
        } else {
            "modified"
        };
        let remote = if c.theirs_deleted() {
            "deleted"
        } else if c.is_new {
            "added"
        } else {
            "modified"
        };
        table.add_row(vec![
            Cell::new(&c.path),
            Cell::new(c.classification.to_string()),
            Cell::new(local),
            Cell::new(remote),
        ]);
    }
    println!("{}", table);
}

fn cmd_conflicts(config: ProjsyncConfig, dir: &Path, preview: bool, json: bool) -> Result<()> {
    let conflicts = pending_conflicts(config, dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }
    if conflicts.is_empty() {
        println!("{}", style::success("No pending conflicts"));
        return Ok(());
    }

    println!();
    print_conflict_table(&conflicts);

    if preview {
        for conflict in &conflicts {
            let merged = Merger::preview(conflict);
            println!();
            let title = format!("── {} ", conflict.path);
            if merged.has_conflicts {
                println!(
                    "{} {}",
                    style::header(&title),
                    style::warn(&format!("{} conflicting hunk(s)", merged.conflict_markers.len()))
                );
            } else {
                println!("{} {}", style::header(&title), style::success("merges cleanly"));
            }
            print!("{}", merged.merged_content);
            if !merged.merged_content.ends_with('\n') {
                println!();
            }
        }
    }
    println!();
    Ok(())
}

fn cmd_resolve(config: ProjsyncConfig, dir: &Path, path: &str, accept: Accept) -> Result<()> {
    let conflicts = pending_conflicts(config, dir)?;
    let conflict = ConflictResolver::find(&conflicts, path)?;

    let choice = match accept {
        Accept::Ours => ResolutionChoice::Ours,
        Accept::Theirs => ResolutionChoice::Theirs,
        Accept::Delete => ResolutionChoice::Delete,
        Accept::Merged => {
            let merged = Merger::preview(conflict);
            if merged.has_conflicts {
                anyhow::bail!(
                    "'{}' does not merge cleanly ({} conflicting hunk(s)); pick a side or edit the file",
                    path,
                    merged.conflict_markers.len()
                );
            }
            ResolutionChoice::Merged(merged.merged_content)
        }
    };

    let resolved = ConflictResolver::apply(dir, conflict, &choice)
        .with_context(|| format!("failed to write resolution for '{}'", path))?;
    println!(
        "{}",
        style::success(&format!("{} resolved ({})", resolved.path, resolved.resolution))
    );
    Ok(())
}

async fn cmd_complete(config: ProjsyncConfig, dir: &Path) -> Result<()> {
    let credentials = config.credentials().context("failed to resolve credentials")?;
    let author = config.author();
    let conflicts = pending_conflicts(config.clone(), dir)?;
    let resolved: Vec<_> = conflicts
        .iter()
        .map(|c| ConflictResolver::from_workdir(dir, c))
        .collect();

    let sink = SpinnerSink::new();
    let report = MergeCompletion::new(config)
        .complete_merge_with_progress(dir, &credentials, &author, &resolved, &sink)
        .await;
    sink.finish();
    let report = report.context("merge completion failed")?;

    let kind = if report.is_merge_commit {
        "Merge commit"
    } else {
        "Commit"
    };
    println!(
        "{}",
        style::success(&format!(
            "{} {} created ({} resolved, {} absorbed from remote)",
            kind,
            style::short_sha(&report.commit),
            resolved.len(),
            report.absorbed_paths
        ))
    );
    if report.pushed {
        println!("{}", style::success("Pushed to the remote"));
    } else {
        println!("{}", style::warn("Push failed; the commit is kept locally"));
    }
    Ok(())
}
