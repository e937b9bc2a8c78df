//! sessiond binary entry point.

use std::process::ExitCode;
use std::sync::Arc;

use session_registry::cli::{self, Args};
use session_registry::config::Config;
use session_registry::identity::InMemoryIdentity;
use session_registry::store::{MemoryStore, PersistenceExecutor};
use session_registry::{logging, EventBus, SessionCache, SessionManager};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Run with --help for usage");
            return ExitCode::FAILURE;
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&args)?;
    logging::init_with_filter(config.log_filter()).ok();

    info!("sessiond v{}", env!("CARGO_PKG_VERSION"));

    let session_config = config.to_session_config()?;
    let events = EventBus::new(config.sessions.event_capacity);
    let identity = Arc::new(
        InMemoryIdentity::from_accounts(config.identity.users.clone()).with_events(events.clone()),
    );
    info!(users = identity.count(), "identity service loaded");

    let cache = Arc::new(SessionCache::new(events));
    let executor = PersistenceExecutor::current(Arc::new(MemoryStore::new()))?;
    let manager = SessionManager::new(session_config.clone(), Arc::clone(&cache), identity, executor)?;

    let sweeper = cache.spawn_sweeper(session_config.sweep_interval);
    let watcher = cache.watch();
    info!(
        sweep_secs = session_config.sweep_interval.as_secs(),
        "session registry running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    sweeper.abort();
    watcher.abort();
    manager.executor().drain().await?;
    info!(sessions = manager.cache().len(), "sessiond stopped");
    Ok(())
}
