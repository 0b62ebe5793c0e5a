mod logging;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clausebook::config::Config;
use clausebook::loader::LoadSource;
use clausebook::remote::{Clause, ClauseDraft, HttpRemote};
use clausebook::sync_worker::SyncWorker;
use clausebook::{CacheEngine, CacheError, ClauseLibrary, Delivery, DocumentHost, LibraryOptions};

#[derive(Parser, Debug)]
#[command(name = "clausebook")]
#[command(about = "An offline-first clause library for document drafting")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/clausebook/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Work from the local cache only; writes are queued
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List clauses
  List {
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    client: Option<String>,
  },
  /// Show one clause with its usage
  Show { id: String },
  /// Write a clause body to stdout and count the use
  Insert { id: String },
  /// Most used clauses
  Top {
    #[arg(short, long, default_value_t = 10)]
    limit: usize,
  },
  /// Most recently used clauses
  Recent {
    #[arg(short, long, default_value_t = 10)]
    limit: usize,
  },
  /// Version history of a clause, newest first
  History {
    id: String,
    #[arg(short, long)]
    limit: Option<usize>,
  },
  /// Make an old version current again
  Restore { version_id: String },
  /// Add a clause
  Add {
    #[arg(long)]
    title: String,
    #[arg(long)]
    body: String,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    client: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
  },
  /// Edit a clause
  Edit {
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    body: Option<String>,
    #[arg(long)]
    category: Option<String>,
    /// Change note recorded with the new version
    #[arg(short, long)]
    note: Option<String>,
  },
  /// Delete a clause
  Remove { id: String },
  /// Replay queued changes now
  Sync,
  /// Show queued changes
  Outbox {
    /// Drop a queued operation instead of listing
    #[arg(long)]
    drop: Option<String>,
  },
  /// Keep syncing in the foreground until interrupted
  Watch,
}

/// Document host that writes inserted text to stdout.
struct StdoutHost;

impl DocumentHost for StdoutHost {
  fn apply_to_document(&self, text: &str) -> clausebook::Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", text).map_err(|e| CacheError::Document(e.to_string()))
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init_or_warn(&config.logging);

  let engine = CacheEngine::builder(config.cache.clone()).build();
  if let Some(warning) = engine.storage_warning() {
    eprintln!("warning: {}", warning);
  }

  let remote = Arc::new(HttpRemote::from_config(&config)?);
  let library = Arc::new(ClauseLibrary::new(
    engine,
    remote,
    LibraryOptions::from_config(&config),
  ));
  if args.offline {
    library.set_sync_enabled(false);
  }

  run(args.command, library, &config, args.offline).await
}

async fn run(
  command: Command,
  library: Arc<ClauseLibrary<HttpRemote>>,
  config: &Config,
  offline: bool,
) -> Result<()> {
  match command {
    Command::List { category, client } => {
      let clauses = list(&library, offline).await?;
      for clause in clauses.iter().filter(|c| {
        category.as_ref().map_or(true, |cat| c.category.as_ref() == Some(cat))
          && client.as_ref().map_or(true, |id| c.client_id.as_ref() == Some(id))
      }) {
        print_row(clause);
      }
    }
    Command::Show { id } => {
      let clause = require(&library, &id)?;
      let stats = library.usage().stats_for(&id)?;
      println!("{}  {}", clause.id, clause.title);
      if let Some(category) = &clause.category {
        println!("category: {}", category);
      }
      if !clause.tags.is_empty() {
        println!("tags: {}", clause.tags.join(", "));
      }
      println!("uses: {}", stats.use_count);
      if let Some(last_used) = stats.last_used {
        println!("last used: {}", last_used.format("%Y-%m-%d %H:%M"));
      }
      println!();
      println!("{}", clause.body);
    }
    Command::Insert { id } => {
      let insertion = library.insert_into(&id, &StdoutHost)?;
      if let Some(mirror) = insertion.mirror {
        let _ = mirror.await;
      }
    }
    Command::Top { limit } => {
      for (clause, stats) in library.most_used(limit)? {
        println!("{:>5}  {:<38}  {}", stats.use_count, clause.id, clause.title);
      }
    }
    Command::Recent { limit } => {
      for (clause, stats) in library.recently_used(limit)? {
        let when = stats
          .last_used
          .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
          .unwrap_or_default();
        println!("{}  {:<38}  {}", when, clause.id, clause.title);
      }
    }
    Command::History { id, limit } => {
      for snapshot in library.history(&id, limit)? {
        println!(
          "{}  {}  {:<12}  {}",
          snapshot.version_id,
          snapshot.created_at.format("%Y-%m-%d %H:%M"),
          snapshot.created_by,
          snapshot.change_note.as_deref().unwrap_or("")
        );
      }
    }
    Command::Restore { version_id } => {
      let outcome = library.restore(&version_id).await?;
      report(&outcome.clause, &outcome.delivery);
    }
    Command::Add {
      title,
      body,
      category,
      client,
      tags,
    } => {
      let draft = ClauseDraft {
        title,
        body,
        category,
        tags,
        client_id: client,
      };
      let outcome = library.create(draft).await?;
      report(&outcome.clause, &outcome.delivery);
    }
    Command::Edit {
      id,
      title,
      body,
      category,
      note,
    } => {
      let mut clause = require(&library, &id)?;
      if let Some(title) = title {
        clause.title = title;
      }
      if let Some(body) = body {
        clause.body = body;
      }
      if category.is_some() {
        clause.category = category;
      }
      let outcome = library.update(clause, note.as_deref()).await?;
      report(&outcome.clause, &outcome.delivery);
    }
    Command::Remove { id } => {
      let outcome = library.delete(&id).await?;
      report(&outcome.clause, &outcome.delivery);
    }
    Command::Sync => {
      if offline {
        return Err(eyre!("Cannot sync in offline mode"));
      }
      let summary = library.sync().await?;
      println!(
        "applied {}, failed {}, deferred {}, parked {}",
        summary.applied,
        summary.failed,
        summary.deferred,
        summary.dead_lettered.len()
      );
      if summary.stopped_early {
        println!("stopped early: remote unreachable");
      }
    }
    Command::Outbox { drop } => {
      if let Some(operation_id) = drop {
        library.outbox().remove(&operation_id)?;
        println!("dropped {}", operation_id);
        return Ok(());
      }
      for op in library.outbox().list_pending()? {
        let state = if library.policy().is_dead(&op) {
          "parked"
        } else {
          "pending"
        };
        println!(
          "{}  {:<7}  {:<6}  {}  attempts={} rejected={}  {}",
          op.operation_id,
          state,
          op.kind.as_str(),
          op.record_id,
          op.attempts,
          op.conflicts,
          op.last_error.as_deref().unwrap_or("")
        );
      }
    }
    Command::Watch => {
      let mut worker = SyncWorker::spawn(Arc::clone(&library), config.sync.interval());
      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => break,
          summary = worker.next_summary() => match summary {
            Some(summary) if !summary.is_clean() || summary.applied > 0 => println!(
              "applied {}, failed {}, deferred {}, parked {}",
              summary.applied,
              summary.failed,
              summary.deferred,
              summary.dead_lettered.len()
            ),
            Some(_) => {}
            None => break,
          },
        }
      }
      worker.shutdown().await;
    }
  }

  Ok(())
}

async fn list(library: &ClauseLibrary<HttpRemote>, offline: bool) -> Result<Vec<Clause>> {
  if offline {
    return Ok(
      library
        .cache()
        .get_all()?
        .into_iter()
        .map(|record| record.data)
        .collect(),
    );
  }

  let loaded = library.load().await?;
  match loaded.source {
    LoadSource::Offline => eprintln!(
      "remote unreachable, showing cached clauses{}",
      loaded
        .cached_at
        .map(|t| format!(" from {}", t.format("%Y-%m-%d %H:%M")))
        .unwrap_or_default()
    ),
    LoadSource::CacheFresh | LoadSource::Network => {}
  }
  // Let the background refresh finish before the runtime shuts down
  if let Some(refresh) = loaded.refresh {
    let _ = refresh.await;
  }
  Ok(loaded.data)
}

fn require(library: &ClauseLibrary<HttpRemote>, id: &str) -> Result<Clause> {
  library
    .get(id)?
    .ok_or_else(|| eyre!("No clause {} in the local library", id))
}

fn print_row(clause: &Clause) {
  println!(
    "{:<38}  {:<12}  {}",
    clause.id,
    clause.category.as_deref().unwrap_or("-"),
    clause.title
  );
}

fn report(clause: &Clause, delivery: &Delivery) {
  match delivery {
    Delivery::Applied => println!("{}  saved", clause.id),
    Delivery::Queued(operation_id) => {
      println!("{}  saved locally, queued as {}", clause.id, operation_id)
    }
    Delivery::Cancelled => println!("{}  removed before it was ever sent", clause.id),
  }
}
