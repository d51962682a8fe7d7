use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gym_sync::client::{OfflineClient, Submission};
use gym_sync::config::Config;
use gym_sync::event::{Event, EventHandler, EventSender, SyncEvent};
use gym_sync::http::ServerClient;
use gym_sync::store::{CachedRecord, DurableStore, QueuedAction, SqliteStore};
use gym_sync::sync::{connectivity_channel, Connectivity, ConnectivityProbe, DrainOutcome};
use gym_sync::worker::{CacheWorker, Request, ResponseCache, WorkerState};

#[derive(Parser, Debug)]
#[command(name = "gym-sync")]
#[command(about = "Offline cache, action queue and sync for the gym manager")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/gym-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the log file in the data directory
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the cache, watch connectivity and sync queued actions until interrupted
  Run,
  /// Prime and activate the configured cache generation
  Install,
  /// Fetch a path through the cache worker
  Fetch {
    path: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// List cache generations
  Generations,
  /// Save a member record locally
  Save { id: String, json: String },
  /// List locally saved members
  Members,
  /// Submit an action, queueing it when the server is unreachable
  Enqueue { endpoint: String, json: String },
  /// List queued actions, oldest first
  Pending,
  /// Deliver queued actions once
  Drain,
  /// Drop a queued action without delivering it
  Discard { key: i64 },
  /// Empty the local store
  Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  let _log_guard = init_logging(&data_dir, args.log_stderr)?;

  match args.command {
    Command::Run => run(&config).await,
    Command::Install => {
      let worker = open_worker(&config)?;
      install(&worker).await?;
      println!("{} is active", worker.manifest().generation);
      Ok(())
    }
    Command::Fetch { path, navigate } => {
      let worker = open_worker(&config)?;
      let request = if navigate {
        Request::navigate(path)
      } else {
        Request::get(path)
      };
      let result = worker.handle(&request).await?;
      eprintln!(
        "{} {} {:?}{}",
        result.response.status,
        result.response.header("content-type").unwrap_or("-"),
        result.source,
        result
          .cached_at
          .map(|at| format!(" (cached {})", at.to_rfc3339()))
          .unwrap_or_default()
      );
      println!("{}", String::from_utf8_lossy(&result.response.body));
      Ok(())
    }
    Command::Generations => {
      let cache = ResponseCache::open(&config.responses_path()?)?;
      let current = cache.current()?;
      for generation in cache.generations()? {
        let marker = if current.as_deref() == Some(generation.as_str()) {
          "*"
        } else {
          " "
        };
        println!("{} {} ({} responses)", marker, generation, cache.len(&generation)?);
      }
      Ok(())
    }
    Command::Save { id, json } => {
      let client = open_client(&config, connectivity_channel().1)?;
      let payload = serde_json::from_str(&json).map_err(|e| eyre!("Invalid JSON: {}", e))?;
      client.save(&CachedRecord::new(id, payload))?;
      Ok(())
    }
    Command::Members => {
      let client = open_client(&config, connectivity_channel().1)?;
      for member in client.get_all::<CachedRecord>()? {
        println!("{}\t{}", member.id, member.payload);
      }
      Ok(())
    }
    Command::Enqueue { endpoint, json } => {
      let payload = serde_json::from_str(&json).map_err(|e| eyre!("Invalid JSON: {}", e))?;

      // No probe is running here, so ask the server once before submitting
      let (tx, rx) = connectivity_channel();
      ConnectivityProbe::new(ServerClient::new(&config.server)?, config.sync.probe_interval())
        .check_once(&tx)
        .await;
      let client = open_client(&config, rx)?;

      match client.submit(&endpoint, payload).await? {
        Submission::Delivered => println!("delivered"),
        Submission::Queued(key) => println!("queued as {}", key),
        Submission::Rejected(e) => return Err(eyre!("{}", e)),
      }
      Ok(())
    }
    Command::Pending => {
      let client = open_client(&config, connectivity_channel().1)?;
      for action in client.queue().pending()? {
        print_action(&action, client.queue().attempts(action.key)?);
      }
      Ok(())
    }
    Command::Drain => {
      let client = open_client(&config, connectivity_channel().1)?;
      match client.drain_once().await? {
        DrainOutcome::Completed(report) => {
          println!(
            "delivered {}, {} remaining",
            report.delivered.len(),
            report.remaining
          );
          if let Some(blocked) = report.blocked {
            println!(
              "blocked at {} {} after {} attempts: {}",
              blocked.key, blocked.endpoint, blocked.attempts, blocked.error
            );
          }
        }
        DrainOutcome::AlreadyRunning => println!("a drain is already running"),
      }
      Ok(())
    }
    Command::Discard { key } => {
      let client = open_client(&config, connectivity_channel().1)?;
      client.queue().discard(key)?;
      Ok(())
    }
    Command::Reset => {
      let store = SqliteStore::open(&config.store_path()?)?;
      store.reset()?;
      store.close()?;
      println!("local store emptied");
      Ok(())
    }
  }
}

async fn run(config: &Config) -> Result<()> {
  let server = ServerClient::new(&config.server)?;
  let worker = Arc::new(open_worker(config)?);
  if worker.state() != WorkerState::Active {
    // The previous generation keeps serving if this one cannot be installed
    if let Err(e) = install(&worker).await {
      error!(error = %e, "cache install failed");
    }
  }

  let (tx, rx) = connectivity_channel();
  let mut events = EventHandler::new(config.cache.refresh_interval());
  let client = OfflineClient::new(
    Arc::new(SqliteStore::open(&config.store_path()?)?),
    Arc::new(server.clone()),
    config.sync.max_attempts,
    events.sender(),
    rx.clone(),
  );

  tokio::spawn(Arc::clone(client.coordinator()).observe(rx));
  tokio::spawn(ConnectivityProbe::new(server, config.sync.probe_interval()).run(tx));

  info!(server = %config.server.url, "sync running");
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.next() => match event {
        Some(Event::Sync(event)) => print_sync_event(&event),
        Some(Event::Tick) => {
          let worker = Arc::clone(&worker);
          tokio::spawn(async move {
            match worker.refresh_manifest().await {
              Ok(report) if !report.failed.is_empty() => {
                warn!(failed = ?report.failed, "manifest refresh incomplete")
              }
              Ok(_) => {}
              Err(e) => error!(error = %e, "manifest refresh failed"),
            }
          });
        }
        None => break,
      },
    }
  }

  info!("sync stopped");
  Ok(())
}

async fn install(worker: &CacheWorker<ServerClient>) -> Result<()> {
  worker.install().await?;
  let evicted = worker.activate()?;
  if !evicted.is_empty() {
    info!(?evicted, "evicted stale cache generations");
  }
  Ok(())
}

fn open_worker(config: &Config) -> Result<CacheWorker<ServerClient>> {
  let server = ServerClient::new(&config.server)?;
  let cache = ResponseCache::open(&config.responses_path()?)?;
  Ok(CacheWorker::new(server, cache, config.cache.manifest())?)
}

fn open_client(
  config: &Config,
  connectivity: watch::Receiver<Connectivity>,
) -> Result<OfflineClient<SqliteStore, ServerClient>> {
  Ok(OfflineClient::new(
    Arc::new(SqliteStore::open(&config.store_path()?)?),
    Arc::new(ServerClient::new(&config.server)?),
    config.sync.max_attempts,
    EventSender::disconnected(),
    connectivity,
  ))
}

fn print_action(action: &QueuedAction, attempts: u32) {
  println!(
    "{}\t{}\t{}\t{} failed attempts\t{}",
    action.key,
    action.queued_at.to_rfc3339(),
    action.endpoint,
    attempts,
    action.payload
  );
}

fn print_sync_event(event: &SyncEvent) {
  match event {
    SyncEvent::Connectivity(state) => println!("[{}]", state),
    SyncEvent::DrainStarted { pending } => println!("syncing {} queued actions", pending),
    SyncEvent::DrainFinished {
      delivered,
      remaining,
    } => println!("synced {}, {} still queued", delivered, remaining),
    SyncEvent::DrainFailed(message) => println!("sync failed: {}", message),
    SyncEvent::ActionStuck {
      key,
      endpoint,
      attempts,
    } => println!(
      "action {} to {} failed {} times; fix it or run `gym-sync discard {}`",
      key, endpoint, attempts, key
    ),
  }
}

fn init_logging(data_dir: &Path, stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("GYM_SYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  if stderr {
    tracing_subscriber::registry()
      .with(filter)
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .init();
    return Ok(None);
  }

  std::fs::create_dir_all(data_dir)
    .map_err(|e| eyre!("Failed to create {}: {}", data_dir.display(), e))?;
  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(data_dir, "gym-sync.log"));
  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();
  Ok(Some(guard))
}
