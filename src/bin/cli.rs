//! Tidesync CLI
//!
//! Offline-first todo list over a local SQLite cache and a remote collection.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tidesync::clock::SystemClock;
use tidesync::network::Connectivity;
use tidesync::remote::{HttpRemoteClient, RemoteClient};
use tidesync::storage::{KeyValueStore, SqliteStore, CACHED_ITEMS_KEY};
use tidesync::sync::{QueueStore, ResolutionStrategy, SyncOrchestrator, SyncResult, SyncWorker};
use tidesync::*;

#[derive(Parser)]
#[command(name = "tidesync")]
#[command(about = "Offline-first todo list with background sync")]
#[command(version)]
struct Cli {
    /// Database path
    #[arg(
        long,
        env = "TIDESYNC_DB_PATH",
        default_value = "~/.local/share/tidesync/offline.db"
    )]
    db_path: String,

    /// Storage mode (local or cloud-safe)
    #[arg(long, env = "TIDESYNC_STORAGE_MODE", default_value = "local")]
    storage_mode: String,

    /// Base URL of the remote API
    #[arg(long, env = "TIDESYNC_REMOTE_URL")]
    remote_url: Option<String>,

    /// Record changes locally without contacting the remote
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List items
    List,
    /// Add an item
    Add {
        /// Item title
        title: String,
    },
    /// Change an item
    Update {
        /// Item ID
        id: i64,
        /// New title
        #[arg(short, long)]
        title: Option<String>,
        /// Completion flag
        #[arg(short, long)]
        completed: Option<bool>,
    },
    /// Flip an item's completion flag
    Toggle {
        /// Item ID
        id: i64,
    },
    /// Delete an item
    Delete {
        /// Item ID
        id: i64,
    },
    /// Run one sync pass
    Sync,
    /// Show sync status
    Status,
    /// List queued mutations
    Pending,
    /// List recorded conflicts
    Conflicts {
        /// Forget every recorded conflict instead
        #[arg(long)]
        clear: bool,
    },
    /// Resolve a conflict
    Resolve {
        /// Conflict ID
        conflict_id: String,
        /// keep-local, keep-remote or take-newer
        #[arg(short, long, default_value = "take-newer")]
        strategy: ResolutionStrategy,
    },
    /// List mutations that exhausted their retries
    DeadLetters {
        /// Drop every dead letter instead
        #[arg(long)]
        clear: bool,
    },
    /// Put dead letters back in the queue
    Retry {
        /// Mutation ID (all dead letters if omitted)
        id: Option<String>,
    },
    /// Forget queued mutations, conflicts and cached items
    Reset {
        /// Also clear the remote collection
        #[arg(long)]
        remote: bool,
    },
    /// Keep syncing in the background until interrupted
    Watch,
}

struct App {
    store: Arc<SqliteStore>,
    queue: Arc<QueueStore>,
    remote: Arc<dyn RemoteClient>,
    connectivity: Connectivity,
    cache: Arc<LocalCache>,
    orchestrator: Arc<SyncOrchestrator>,
    config: SyncConfig,
}

impl App {
    async fn open(cli: &Cli) -> anyhow::Result<Self> {
        let storage_mode: StorageMode = cli
            .storage_mode
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let store = Arc::new(SqliteStore::open(StorageConfig {
            db_path: shellexpand::tilde(&cli.db_path).to_string(),
            storage_mode,
        })?);

        let mut config = SyncConfig::from_env();
        if let Some(ref url) = cli.remote_url {
            config.remote_url = url.clone();
        }

        let clock = Arc::new(SystemClock);
        let queue = Arc::new(QueueStore::new(store.clone(), clock.clone()));
        let remote: Arc<dyn RemoteClient> = Arc::new(HttpRemoteClient::new(&config)?);
        let orchestrator = Arc::new(
            SyncOrchestrator::new(remote.clone(), queue.clone(), clock.clone())
                .with_max_retries(config.max_mutation_retries),
        );

        let online = !cli.offline && orchestrator.probe_remote().await;
        if !cli.offline && !online {
            eprintln!("Remote {} unreachable, working offline", config.remote_url);
        }
        let connectivity = Connectivity::new(online);

        let cache = Arc::new(LocalCache::new(
            store.clone(),
            queue.clone(),
            remote.clone(),
            connectivity.clone(),
            clock,
        ));

        Ok(Self {
            store,
            queue,
            remote,
            connectivity,
            cache,
            orchestrator,
            config,
        })
    }

    async fn sync(&self) -> Result<SyncResult> {
        let snapshot = self.cache.begin_sync();
        let result = self.orchestrator.run_sync(&snapshot).await;
        self.cache.apply_sync_result(&result)?;
        Ok(result)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let app = App::open(&cli).await?;

    match cli.command {
        Commands::List => {
            let items = app.cache.load().await?;
            if items.is_empty() {
                println!("No items");
            }
            for item in items {
                print_entity(&item);
            }
        }

        Commands::Add { title } => {
            let item = app.cache.create(&title).await?;
            print_entity(&item);
        }

        Commands::Update {
            id,
            title,
            completed,
        } => {
            let patch = EntityPatch {
                title,
                completed,
                last_modified: None,
            };
            if patch.is_empty() {
                anyhow::bail!("nothing to update, pass --title or --completed");
            }
            let item = app.cache.update(id, patch).await?;
            print_entity(&item);
        }

        Commands::Toggle { id } => {
            let item = app.cache.toggle(id).await?;
            print_entity(&item);
        }

        Commands::Delete { id } => {
            app.cache.delete(id).await?;
            println!("Deleted #{}", id);
        }

        Commands::Sync => {
            if !app.connectivity.is_online() {
                anyhow::bail!("cannot sync while offline");
            }
            let result = app.sync().await?;
            print_sync_result(&result);
        }

        Commands::Status => {
            let status = app.orchestrator.status();
            println!(
                "Connectivity:   {}",
                if app.connectivity.is_online() {
                    "online"
                } else {
                    "offline"
                }
            );
            println!("Pending:        {}", status.pending_changes);
            println!("Conflicts:      {}", status.conflicts);
            println!("Dead letters:   {}", status.dead_letters);
            match status.last_sync {
                Some(at) => println!("Last sync:      {}", at.to_rfc3339()),
                None => println!("Last sync:      never"),
            }
        }

        Commands::Pending => {
            let pending = app.queue.list_pending();
            if pending.is_empty() {
                println!("Queue is empty");
            }
            for mutation in pending {
                print_mutation(&mutation);
            }
        }

        Commands::Conflicts { clear: true } => {
            let count = app.queue.list_conflicts().len();
            app.queue.clear_conflicts()?;
            println!("Cleared {} conflicts", count);
        }

        Commands::Conflicts { clear: false } => {
            let conflicts = app.queue.list_conflicts();
            if conflicts.is_empty() {
                println!("No conflicts");
            }
            for conflict in conflicts {
                println!(
                    "{} #{} local \"{}\" vs remote \"{}\" (detected {})",
                    conflict.id,
                    conflict.entity_id,
                    truncate(&conflict.local.title, 30),
                    truncate(&conflict.remote.title, 30),
                    conflict.detected_at.to_rfc3339()
                );
            }
        }

        Commands::Resolve {
            conflict_id,
            strategy,
        } => {
            let resolution = app.cache.resolve_conflict(&conflict_id, strategy)?;
            println!("Resolved with {:?}", resolution.applied);
            print_entity(&resolution.entity);
        }

        Commands::DeadLetters { clear: true } => {
            let count = app.queue.list_dead_letters().len();
            app.queue.clear_dead_letters()?;
            println!("Dropped {} dead letters", count);
        }

        Commands::DeadLetters { clear: false } => {
            let dead = app.queue.list_dead_letters();
            if dead.is_empty() {
                println!("No dead letters");
            }
            for mutation in dead {
                print_mutation(&mutation);
            }
        }

        Commands::Retry { id } => {
            let ids: Vec<String> = match id {
                Some(id) => vec![id],
                None => app
                    .queue
                    .list_dead_letters()
                    .into_iter()
                    .map(|m| m.id)
                    .collect(),
            };
            let mut requeued = 0;
            for id in ids {
                match app.queue.requeue_dead_letter(&id)? {
                    Some(_) => requeued += 1,
                    None => eprintln!("No dead letter with id {}", id),
                }
            }
            println!("Requeued {} mutations", requeued);
        }

        Commands::Reset { remote } => {
            app.queue.clear_all()?;
            app.store.remove(CACHED_ITEMS_KEY)?;
            app.store.checkpoint()?;
            if remote {
                app.remote.clear().await?;
                println!("Cleared remote collection");
            }
            println!("Local state cleared");
        }

        Commands::Watch => {
            watch(app).await?;
        }
    }

    Ok(())
}

/// Background sync with periodic reachability probes, until Ctrl-C
async fn watch(app: App) -> anyhow::Result<()> {
    let every = Duration::from_secs(app.config.sync_interval_secs.max(1));
    app.cache.load().await?;

    let worker = SyncWorker::start(
        app.orchestrator.clone(),
        app.cache.clone(),
        app.connectivity.clone(),
        every,
    );

    let prober = {
        let orchestrator = app.orchestrator.clone();
        let connectivity = app.connectivity.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                connectivity.set_online(orchestrator.probe_remote().await);
            }
        })
    };

    println!("Watching {} (Ctrl-C to stop)", app.config.collection_url());
    tokio::signal::ctrl_c().await?;

    prober.abort();
    worker.stop().await?;

    app.store.checkpoint()?;
    let status = app.orchestrator.status();
    println!(
        "Stopped with {} pending, {} conflicts",
        status.pending_changes, status.conflicts
    );
    Ok(())
}

fn print_entity(item: &Entity) {
    println!(
        "#{} [{}] {} ({})",
        item.id,
        if item.completed { "x" } else { " " },
        truncate(&item.title, 60),
        item.sync_status
    );
}

fn print_mutation(mutation: &PendingMutation) {
    println!(
        "{} {} #{} retries={} queued {}",
        mutation.id,
        mutation.kind,
        mutation.entity_id,
        mutation.retry_count,
        mutation.timestamp.to_rfc3339()
    );
}

fn print_sync_result(result: &SyncResult) {
    println!(
        "Synced {} / failed {} / dead-lettered {} / new conflicts {}",
        result.synced_operations.len(),
        result.failed_operations.len(),
        result.dead_lettered.len(),
        result.conflicts.len()
    );
    for (old, new) in &result.remapped_ids {
        println!("  #{} is now #{}", old, new);
    }
    if let Some(ref error) = result.error {
        println!("Error: {}", error);
    }
}

fn truncate(s: &str, max: usize) -> String {
    let first_line = s.lines().next().unwrap_or(s);
    if first_line.chars().count() <= max {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
