//! # remotedoc CLI (`rdoc`)
//!
//! The `rdoc` binary runs the mirror server and provides operator commands
//! for one-shot syncs and store inspection.
//!
//! ## Usage
//!
//! ```bash
//! rdoc --config ./config/rdoc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rdoc serve` | Sync all repositories, then serve tools (and webhooks in webhook mode) |
//! | `rdoc sync` | One-shot sync of all (or one) configured repositories |
//! | `rdoc list` | List configured repositories with their spec addresses |
//! | `rdoc read <url>` | Resolve one `remotedoc://` address from the local store |
//! | `rdoc status` | Show per-repository sync status |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use remotedoc::config::{load_config, Config, SyncMode};
use remotedoc::discovery::DiscoveryService;
use remotedoc::fetcher::GitHubUpstream;
use remotedoc::registry::{Registry, RepoKey};
use remotedoc::resolver::Resolver;
use remotedoc::server::{run_server, AppState, WebhookIntake};
use remotedoc::store::MirrorStore;
use remotedoc::sync::{SyncOrchestrator, SyncOutcome, SyncReason, SyncStatus};
use remotedoc::webhook::WebhookVerifier;

/// remotedoc: always-current documentation mirrors for AI tools.
#[derive(Parser)]
#[command(
    name = "rdoc",
    about = "remotedoc — always-current documentation mirrors from Git repositories for AI tools",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rdoc.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync all repositories, then serve the document tools over HTTP.
    ///
    /// In polling mode every repository is resynced on a jittered
    /// interval; in webhook mode syncs are triggered only by verified
    /// push notifications on `/webhooks/github`.
    Serve,

    /// Sync configured repositories once and exit.
    Sync {
        /// Limit the sync to one repository.
        #[arg(long, requires = "repo")]
        owner: Option<String>,
        #[arg(long, requires = "owner")]
        repo: Option<String>,
        /// Branch of the selected repository (defaults to `main`).
        #[arg(long, default_value = "main")]
        branch: String,
    },

    /// List configured repositories with descriptions and spec addresses.
    List,

    /// Resolve one remotedoc:// address against the local store.
    Read {
        /// Address, e.g. `remotedoc://owner/repo/main/docs/spec.md`.
        url: String,
    },

    /// Show per-repository sync status.
    Status,
}

/// Engine components wired from one configuration.
struct Engine {
    registry: Arc<Registry>,
    store: Arc<MirrorStore>,
    upstream: Arc<GitHubUpstream>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl Engine {
    fn build(config: &Config) -> Result<Self> {
        let registry = Arc::new(Registry::new(config.repositories.clone()));
        let store = Arc::new(MirrorStore::open(&config.store.root)?);
        let upstream = Arc::new(GitHubUpstream::new(
            &config.github,
            Duration::from_secs(config.sync.fetch_timeout_secs),
        ));
        let orchestrator = SyncOrchestrator::new(
            registry.clone(),
            store.clone(),
            upstream.clone(),
            config.sync.clone(),
        );
        Ok(Self {
            registry,
            store,
            upstream,
            orchestrator,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => run_serve(&config).await,
        Commands::Sync {
            owner,
            repo,
            branch,
        } => run_sync(&config, owner, repo, branch).await,
        Commands::List => run_list(&config).await,
        Commands::Read { url } => run_read(&config, &url),
        Commands::Status => run_status(&config).await,
    }
}

async fn run_serve(config: &Config) -> Result<()> {
    let engine = Engine::build(config)?;

    // Initial sync before the listeners start; per-repo failures are
    // recorded, not fatal. Stale-but-valid content beats no content.
    let results = engine.orchestrator.clone().sync_all(SyncReason::Manual).await;
    for (key, outcome) in &results {
        if let SyncOutcome::Failed { cause } = outcome {
            eprintln!("warning: initial sync of {key} failed: {cause}");
        }
    }

    let webhook = match config.sync.mode {
        SyncMode::Poll => {
            engine.orchestrator.clone().start_polling();
            None
        }
        SyncMode::Webhook => {
            let secret = config
                .server
                .webhook_secret
                .clone()
                .expect("validated at config load");
            let (tx, rx) = mpsc::channel(64);
            let consumer = engine.orchestrator.clone();
            tokio::spawn(async move { consumer.run_webhook_consumer(rx).await });
            Some(WebhookIntake {
                verifier: Arc::new(WebhookVerifier::new(engine.registry.clone(), secret)),
                tasks: tx,
            })
        }
    };

    let state = AppState {
        resolver: Arc::new(Resolver::new(engine.registry.clone(), engine.store.clone())),
        discovery: Arc::new(DiscoveryService::new(
            engine.registry.clone(),
            engine.upstream.clone(),
            Duration::from_secs(config.discovery.description_ttl_secs),
        )),
        orchestrator: engine.orchestrator.clone(),
        webhook,
    };

    run_server(&config.server.bind, state).await
}

async fn run_sync(
    config: &Config,
    owner: Option<String>,
    repo: Option<String>,
    branch: String,
) -> Result<()> {
    let engine = Engine::build(config)?;

    let results = match (owner, repo) {
        (Some(owner), Some(repo)) => {
            let key = RepoKey {
                owner,
                repo,
                branch,
            };
            let outcome = engine
                .orchestrator
                .run_task(remotedoc::sync::SyncTask {
                    key: key.clone(),
                    reason: SyncReason::Manual,
                })
                .await;
            vec![(key, outcome)]
        }
        _ => engine.orchestrator.clone().sync_all(SyncReason::Manual).await,
    };

    let mut failed = false;
    for (key, outcome) in results {
        match outcome {
            SyncOutcome::Published {
                generation,
                revision,
            } => println!("{key}: published generation {generation} at {revision}"),
            SyncOutcome::Unchanged { revision } => println!("{key}: up to date at {revision}"),
            SyncOutcome::Coalesced => println!("{key}: sync already in progress"),
            SyncOutcome::Dropped => {
                failed = true;
                println!("{key}: not configured");
            }
            SyncOutcome::Failed { cause } => {
                failed = true;
                println!("{key}: failed: {cause}");
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_list(config: &Config) -> Result<()> {
    let engine = Engine::build(config)?;
    let discovery = DiscoveryService::new(
        engine.registry.clone(),
        engine.upstream.clone(),
        Duration::from_secs(config.discovery.description_ttl_secs),
    );

    for listing in discovery.list().await {
        println!("{}", listing.repo_name);
        if !listing.repo_description.is_empty() {
            println!("  {}", listing.repo_description);
        }
        println!("  {}", listing.repo_spec_path);
    }
    Ok(())
}

fn run_read(config: &Config, url: &str) -> Result<()> {
    let engine = Engine::build(config)?;
    let resolver = Resolver::new(engine.registry.clone(), engine.store.clone());
    match resolver.read(url) {
        Ok(content) => {
            print!("{content}");
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_status(config: &Config) -> Result<()> {
    let engine = Engine::build(config)?;
    for (key, status) in engine.orchestrator.statuses() {
        match status {
            SyncStatus::Fresh {
                revision,
                synced_at,
            } => println!("{key}: fresh at {revision} ({synced_at})"),
            SyncStatus::Stale {
                revision,
                synced_at,
                cause,
            } => println!("{key}: stale at {revision} ({synced_at}): {cause}"),
            SyncStatus::Failed { cause } => println!("{key}: failed: {cause}"),
        }
    }
    Ok(())
}
