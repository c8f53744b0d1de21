//! # vaultkeep
//!
//! A versioned, deduplicated, optionally-encrypted, optionally-compressed
//! backup engine with content-addressable storage and a transactional
//! manifest.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────┐
//!                    │   CLI (clap) │
//!                    └──────┬──────┘
//!                           │
//!              ┌────────────┼────────────┐
//!              ▼            ▼            ▼
//!        ┌─────────────┐┌──────────┐┌──────────┐
//!        │ Snapshotter ││ Restorer ││   (list) │
//!        └──────┬──────┘└────┬─────┘└────┬─────┘
//!               │             │           │
//!               ▼             ▼           ▼
//!        ┌─────────────────────────────────────┐
//!        │             Backup Store             │
//!        │   (compress → encrypt → blob put)     │
//!        └───────────────┬───────────────────────┘
//!                        │
//!           ┌────────────┼────────────┐
//!           ▼            ▼            ▼
//!      ┌─────────┐  ┌─────────┐  ┌──────────┐
//!      │ Manifest│  │ Crypto  │  │ Backend  │
//!      │(sqlite) │  │(RSA/AES)│  │(local/S3)│
//!      └─────────┘  └─────────┘  └──────────┘
//! ```

mod backend;
mod backup_store;
mod chain;
mod compress;
mod config;
mod crypto;
mod diff;
mod error;
mod hasher;
mod logging;
mod manifest;
mod restorer;
mod snapshotter;

use backend::{Backend, BlobStore};
use backup_store::BackupStore;
use clap::{Parser, Subcommand};
use colored::Colorize;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// vaultkeep — a versioned, deduplicated backup engine
#[derive(Parser, Debug)]
#[command(
    name = "vaultkeep",
    version,
    about = "A versioned, deduplicated backup engine with content-addressed storage and hybrid encryption 🔒"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (overrides default search)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level (e.g. "info", "debug")
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a new configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "vaultkeep.toml")]
        output: PathBuf,

        /// Also generate an RSA-4096 keypair, writing the private key here
        #[arg(long)]
        generate_key: Option<PathBuf>,
    },

    /// Run a backup pass for one configured set
    Backup {
        /// Backup set name (matches a `[backups.<name>]` table)
        #[arg(short, long)]
        name: String,
    },

    /// List manifest entries for one backup set matching a path pattern
    List {
        /// Backup set name
        #[arg(short, long)]
        name: String,

        /// Only show entries whose blob SHA starts with this prefix
        #[arg(long)]
        sha: Option<String>,

        /// Only show entries committed at or before this instant
        #[arg(long)]
        before: Option<String>,

        /// Only show entries committed at or after this instant
        #[arg(long)]
        after: Option<String>,

        /// Regular expression matched against the absolute path
        pattern: String,
    },

    /// Restore files from a backup set into a destination directory
    Restore {
        /// Backup set name
        #[arg(short, long)]
        name: String,

        /// Destination directory to restore into
        #[arg(long)]
        dest: PathBuf,

        /// Restore state as of this instant instead of the latest
        #[arg(long)]
        before: Option<String>,

        /// Proceed even if the destination directory already exists
        #[arg(short = 'y', long)]
        yes: bool,

        /// Regular expression matched against the absolute path
        pattern: String,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{} {}", "error:".red(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> error::Result<()> {
    match &cli.command {
        Command::Init { output, generate_key } => cmd_init(output, generate_key.as_deref()),
        Command::Backup { name } => cmd_backup(&cli, name),
        Command::List {
            name,
            sha,
            before,
            after,
            pattern,
        } => cmd_list(&cli, name, sha.as_deref(), before.as_deref(), after.as_deref(), pattern),
        Command::Restore {
            name,
            dest,
            before,
            yes,
            pattern,
        } => cmd_restore(&cli, name, dest, before.as_deref(), *yes, pattern),
    }
}

// ─── Command implementations ───────────────────────────────────────────────

fn cmd_init(output: &Path, generate_key: Option<&Path>) -> error::Result<()> {
    config::init_config(output)?;
    eprintln!(
        "{} Created configuration file: {}",
        "✓".green(),
        output.display(),
    );

    if let Some(key_path) = generate_key {
        let private = crypto::generate_keypair()?;
        crypto::write_private_key(&private, key_path)?;
        eprintln!("{} Generated RSA-4096 private key: {}", "✓".green(), key_path.display());
    }

    eprintln!("  Edit the file to configure your backup sets, then run:");
    eprintln!("  {} vaultkeep backup --name <set>", "$".bold());
    Ok(())
}

fn cmd_backup(cli: &Cli, name: &str) -> error::Result<()> {
    let cfg = load_config(cli)?;
    let log_level = cli.log_level.clone().unwrap_or_else(|| cfg.settings.log_level.clone());
    logging::init(&log_level);

    let set = cfg
        .backups
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("backup set '{name}' not found in configuration"))?;

    print_header(&format!("Backup — {name}"));

    let backend = Backend::from_config(&set.protocol)?;
    let _lock = backend.acquire_lock()?;

    let (public_key, private_key) = load_keys(set)?;

    let scratch = tempfile::tempdir()?;
    let mut manifest = manifest::Manifest::open(&backend, scratch.path())?;
    let known_keys = manifest.known_blob_wraps()?;
    let backup_store = BackupStore::new(&backend, &set.options, public_key, private_key, known_keys);

    let cancel = install_cancel_handler();
    let stats = snapshotter::run(&mut manifest, &backend, &backup_store, set, name, &cancel)?;

    eprintln!(
        "  {} new={} diff={} base={} metadata-only={} unchanged={} deleted={} failed={}",
        "✓".green(),
        stats.files_new,
        stats.files_changed_diff,
        stats.files_changed_base,
        stats.files_metadata_only,
        stats.files_unchanged,
        stats.files_deleted,
        stats.files_failed,
    );
    if stats.files_failed > 0 {
        eprintln!(
            "  {} {} file(s) failed and were skipped; see logs for details",
            "!".yellow(),
            stats.files_failed
        );
    }

    Ok(())
}

fn cmd_list(
    cli: &Cli,
    name: &str,
    sha_prefix: Option<&str>,
    before: Option<&str>,
    after: Option<&str>,
    pattern: &str,
) -> error::Result<()> {
    let cfg = load_config(cli)?;
    let log_level = cli.log_level.clone().unwrap_or_else(|| cfg.settings.log_level.clone());
    logging::init(&log_level);

    let set = cfg
        .backups
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("backup set '{name}' not found in configuration"))?;

    let backend = Backend::from_config(&set.protocol)?;
    let scratch = tempfile::tempdir()?;
    let manifest = manifest::Manifest::open(&backend, scratch.path())?;

    let re = Regex::new(pattern).map_err(|e| anyhow::anyhow!("invalid pattern: {e}"))?;
    let after_ns = after.map(parse_instant).transpose()?.unwrap_or(i64::MIN);
    let before_ns = before.map(parse_instant).transpose()?.unwrap_or(i64::MAX);

    let mut rows = Vec::new();
    for path in manifest.all_paths()? {
        if !re.is_match(&path) {
            continue;
        }
        for entry in manifest.history(&path)? {
            if entry.commit_time < after_ns || entry.commit_time > before_ns {
                continue;
            }
            if let (Some(prefix), Some(sha)) = (sha_prefix, entry.sha.as_deref()) {
                if !sha.starts_with(prefix) {
                    continue;
                }
            }
            rows.push(entry);
        }
    }
    rows.sort_by(|a, b| a.path.cmp(&b.path).then(a.commit_time.cmp(&b.commit_time)));

    if rows.is_empty() {
        eprintln!("No matching entries found.");
        return Ok(());
    }

    eprintln!(
        "{:<12}  {:<20}  {:>10}  {}",
        "SHA", "COMMIT_TIME", "SIZE", "PATH"
    );
    for entry in &rows {
        let sha_display = entry
            .sha
            .as_deref()
            .map(|s| hasher::short_hash(s, 12).to_string())
            .unwrap_or_else(|| "(deleted)".to_string());
        eprintln!(
            "{:<12}  {:<20}  {:>10}  {}",
            sha_display, entry.commit_time, entry.size, entry.path
        );
    }
    eprintln!();
    eprintln!("  {} entries", rows.len());

    Ok(())
}

fn cmd_restore(
    cli: &Cli,
    name: &str,
    dest: &Path,
    before: Option<&str>,
    yes: bool,
    pattern: &str,
) -> error::Result<()> {
    let cfg = load_config(cli)?;
    let log_level = cli.log_level.clone().unwrap_or_else(|| cfg.settings.log_level.clone());
    logging::init(&log_level);

    let set = cfg
        .backups
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("backup set '{name}' not found in configuration"))?;

    if dest.exists() && dest.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false) && !yes {
        return Err(error::RestoreError::TargetExists(dest.to_path_buf()).into());
    }
    std::fs::create_dir_all(dest)?;

    print_header(&format!("Restore — {name}"));

    let backend = Backend::from_config(&set.protocol)?;
    let (public_key, private_key) = load_keys(set)?;

    let scratch = tempfile::tempdir()?;
    let manifest = manifest::Manifest::open(&backend, scratch.path())?;
    let known_keys = manifest.known_blob_wraps()?;
    let backup_store = BackupStore::new(&backend, &set.options, public_key, private_key, known_keys);

    let re = Regex::new(pattern).map_err(|e| anyhow::anyhow!("invalid pattern: {e}"))?;
    let at = before.map(parse_instant).transpose()?.unwrap_or(i64::MAX);

    let (stats, outcomes) = restorer::restore(&manifest, &backup_store, &re, at, dest)?;

    for outcome in &outcomes {
        if let Err(e) = &outcome.result {
            eprintln!("  {} {}: {}", "✗".red(), outcome.path, e);
        }
    }

    eprintln!();
    eprintln!(
        "  {} matched={} restored={} tombstoned={} failed={}",
        "✓".green(),
        stats.matched,
        stats.restored,
        stats.skipped_tombstones,
        stats.failed,
    );

    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn load_config(cli: &Cli) -> error::Result<config::Config> {
    if let Some(path) = &cli.config {
        config::load_config_from(path)
    } else {
        config::load_config()
    }
}

fn load_keys(
    set: &config::BackupSetConfig,
) -> error::Result<(Option<rsa::RsaPublicKey>, Option<rsa::RsaPrivateKey>)> {
    if !set.options.use_encryption {
        return Ok((None, None));
    }
    let key_path = set
        .private_key_filename
        .as_ref()
        .ok_or(error::CryptoError::MissingKey)?;
    let private = crypto::load_private_key(key_path)?;
    let public = crypto::public_key_of(&private);
    Ok((Some(public), Some(private)))
}

/// Parses a CLI-supplied instant, accepting either raw Unix nanoseconds
/// (the engine's native timestamp representation) or an RFC 3339 timestamp
/// for human convenience.
fn parse_instant(s: &str) -> error::Result<i64> {
    if let Ok(nanos) = s.parse::<i64>() {
        return Ok(nanos);
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_nanos_opt().unwrap_or(i64::MAX))
        .map_err(|e| anyhow::anyhow!("invalid timestamp '{s}': {e}").into())
}

/// Installs a `Ctrl+C` handler that flips a shared flag the Snapshotter
/// polls between files: the current file still finishes its blob-put, then
/// the loop stops and discards anything since the last checkpoint commit.
fn install_cancel_handler() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let _ = ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    });
    cancel
}

fn print_header(action: &str) {
    eprintln!();
    eprintln!("  {} vaultkeep v{} — {action}", "⚡".bold(), env!("CARGO_PKG_VERSION"));
    eprintln!();
}
