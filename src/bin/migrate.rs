//! `engram-migrate`: standalone driver for the Migration Engine (C2), for
//! operators who want to apply or inspect schema changes outside of server
//! startup (which always runs migrations up to the latest version on its
//! own).
//!
//! Exit codes: 0 success, 1 generic failure, 2 validation error (bad CLI
//! input), 3 checksum mismatch (tamper detected), 4 version gap (no-gap rule
//! violation). `MigrationEngine` reports both 3 and 4 as `Error::Conflict`
//! with differing messages since it has no dedicated variants for them; this
//! binary distinguishes them by message content on the way out.

use clap::{Parser, Subcommand};
use engram::error::Error;
use engram::storage::migrations::MigrationEngine;
use engram::storage::Storage;
use engram::types::{StorageConfig, StorageMode};

#[derive(Parser, Debug)]
#[command(name = "engram-migrate", about = "Apply or inspect Engram schema migrations")]
struct Args {
    #[arg(long, env = "ENGRAM_DB_PATH", default_value = "~/.engram/engram.db")]
    db_path: String,

    #[arg(long, env = "ENGRAM_STORAGE_MODE", default_value = "local")]
    storage_mode: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show applied and pending migrations
    Status,
    /// Apply pending migrations, optionally up to a target version
    Up {
        #[arg(long)]
        target: Option<i32>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Roll back applied migrations down to (not including) a target version
    Down {
        #[arg(long)]
        target: i32,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

const EXIT_GENERIC_FAILURE: i32 = 1;
const EXIT_VALIDATION_ERROR: i32 = 2;
const EXIT_CHECKSUM_MISMATCH: i32 = 3;
const EXIT_VERSION_GAP: i32 = 4;

fn exit_code_for(err: &Error) -> i32 {
    match err {
        Error::Validation(_) => EXIT_VALIDATION_ERROR,
        Error::Conflict(msg) if msg.contains("checksum mismatch") => EXIT_CHECKSUM_MISMATCH,
        Error::Conflict(msg) if msg.contains("no-gap rule") => EXIT_VERSION_GAP,
        _ => EXIT_GENERIC_FAILURE,
    }
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("engram-migrate: {err}");
        std::process::exit(exit_code_for(&err));
    }
}

fn run(args: Args) -> engram::Result<()> {
    let db_path = shellexpand::tilde(&args.db_path).into_owned();
    let storage_mode: StorageMode = args.storage_mode.parse()?;
    let storage = Storage::open(StorageConfig { db_path, storage_mode })?;
    let engine = MigrationEngine::new();
    let conn = storage.connection();

    match args.command {
        Command::Status => {
            let report = engine.status(&conn)?;
            println!("current version: {}", report.current_version);
            println!("applied:");
            for record in &report.applied {
                println!(
                    "  {:>4}  {:<32} applied_at={} duration_ms={}",
                    record.version, record.name, record.applied_at, record.duration_ms
                );
            }
            println!("pending: {:?}", report.pending);
        }
        Command::Up { target, dry_run } => {
            engine.up(&conn, target, dry_run)?;
            println!("migrations applied{}", if dry_run { " (dry run)" } else { "" });
        }
        Command::Down { target, dry_run } => {
            engine.down(&conn, target, dry_run)?;
            println!("migrations rolled back to {target}{}", if dry_run { " (dry run)" } else { "" });
        }
    }

    Ok(())
}
