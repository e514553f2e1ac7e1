mod artifacts;
mod auth;
mod blobstore;
mod config;
mod db;
mod error;
mod jobs;
mod lifecycle;
mod models;
mod rebuild;
mod schema;
mod search;
mod snapshot;
mod tagging;
mod thumbnails;
mod util;

use crate::auth::Caller;
use crate::blobstore::{BlobStore, FsBlobStore, MemoryBlobStore};
use crate::config::{AppPaths, EnvOverrides, TrackerConfig};
use crate::db::Store;
use crate::error::Result;
use crate::lifecycle::Tracker;
use crate::search::{KeywordMatcher, DEFAULT_TOP_TAGS};
use crate::tagging::{CommandTagger, FixedTagger, Tagger};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Local data directory (database, backups, uploads).
    #[arg(long, default_value = "data")]
    root: PathBuf,

    /// JSON config file; defaults apply when it does not exist.
    #[arg(long, default_value = "tracker.json")]
    config: PathBuf,

    /// Keep the bucket in memory; nothing is pushed to storage.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker and backup scheduler, reading `<path>[\t<label>]`
    /// upload requests from stdin until EOF.
    Serve,
    /// Upload photos and wait until they are tagged.
    Ingest {
        files: Vec<PathBuf>,
        #[arg(short, long, default_value = "")]
        label: String,
    },
    /// List photos, optionally filtered by tag substring.
    List {
        #[arg(short, long)]
        tag: Option<String>,
    },
    TopTags {
        #[arg(short, long, default_value_t = DEFAULT_TOP_TAGS)]
        limit: usize,
    },
    /// Natural-language search over known tags.
    Search { prompt: Vec<String> },
    /// Replay summaries from the bucket into the store.
    Rebuild {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        since: Option<String>,
    },
    /// Manual backup on behalf of a user or service account.
    Backup {
        #[arg(long, conflicts_with = "service_account")]
        user: Option<String>,
        #[arg(long)]
        service_account: Option<String>,
    },
    Health,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = TrackerConfig::load(&cli.config)?;
    let paths = AppPaths::discover(&cli.root)?;

    if let Command::Health = cli.command {
        return print_json(&Store::open(&paths.db_path)?.health());
    }

    let overrides = EnvOverrides::from_env();
    let blobs: Arc<dyn BlobStore> = if cli.dry_run {
        log::warn!("Dry run: using an in-memory bucket");
        Arc::new(MemoryBlobStore::new())
    } else {
        let bucket = FsBlobStore::new(&config.storage.bucket_root)?;
        log::info!("Bucket at {}", bucket.root().display());
        Arc::new(bucket)
    };
    let tagger: Arc<dyn Tagger> = match overrides.tagger_argv(&config) {
        Some(argv) => Arc::new(CommandTagger::new(argv)?),
        None => {
            log::warn!("No tagger command configured; uploads will get no tags");
            Arc::new(FixedTagger::default())
        }
    };
    let blocked = config.blocked_tags.clone();
    let tracker = Tracker::start(config, &paths, blobs, tagger, &overrides)?;
    log::info!("Startup: {}", serde_json::to_string(tracker.startup_report())?);

    match cli.command {
        Command::Serve => serve(&tracker),
        Command::Ingest { files, label } => {
            let mut receipts = Vec::new();
            for file in &files {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                receipts.push(tracker.accept_upload(file, &name, &label)?);
            }
            let stats = tracker.drain();
            log::info!("Ingest finished: {stats:?}");
            print_json(&receipts)
        }
        Command::List { tag } => print_json(&search::search_by_tag(
            tracker.store(),
            tag.as_deref().unwrap_or_default(),
        )?),
        Command::TopTags { limit } => {
            print_json(&search::top_tags(tracker.store(), limit, &blocked)?)
        }
        Command::Search { prompt } => print_json(&search::search_by_prompt(
            tracker.store(),
            &KeywordMatcher,
            &prompt.join(" "),
        )?),
        Command::Rebuild { force, since } => {
            print_json(&tracker.rebuild(force, since.as_deref()))
        }
        Command::Backup {
            user,
            service_account,
        } => {
            let caller = match (user, service_account) {
                (Some(email), _) => Caller::User { email },
                (None, Some(subject)) => Caller::ServiceAccount { subject },
                (None, None) => Caller::Anonymous,
            };
            print_json(&tracker.trigger_backup(&caller)?)
        }
        Command::Health => print_json(&tracker.health()),
    }
}

fn serve(tracker: &Tracker) -> Result<()> {
    tracker.spawn_backup_scheduler();
    log::info!("Reading upload requests from stdin");
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (path, label) = line.split_once('\t').unwrap_or((line, ""));
        let path = PathBuf::from(path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match tracker.accept_upload(&path, &name, label) {
            Ok(receipt) => print_json(&receipt)?,
            Err(err) => log::warn!("Rejected upload {}: {}", path.display(), err),
        }
    }
    let stats = tracker.drain();
    log::info!("Input closed; processed {stats:?}");
    tracker.shutdown();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
