use std::sync::Arc;

use anyhow::{Context, Result};
use beach_cache::client;
use beach_cache::config::{Cli, Command, DiscoveryConfig, DiscoveryMode, GetArgs, NodeConfig};
use beach_cache::coordination_redis::RedisCoordinator;
use beach_cache::discovery::{AddressSource, PeerResolver};
use beach_cache::metrics;
use beach_cache::registry::{Registrar, Registration};
use beach_cache::ring::{self, PeerRing};
use beach_cache::routes;
use beach_cache::source::{self, TableLoader};
use beach_cache::state::AppState;
use beach_cache::telemetry::init_tracing;
use cache_sdk::coordination::{CoordinationStore, MemoryCoordinator};
use cache_sdk::group::{Group, GroupRegistry};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);

    match cli.into_command() {
        Command::Serve(args) => serve(NodeConfig::try_from(args)?).await,
        Command::Get(args) => get_once(args).await,
    }
}

async fn serve(config: NodeConfig) -> Result<()> {
    let peer_id = config.peer_id();
    info!(
        listen_addr = %config.listen_addr,
        peer_id = %peer_id,
        discovery = ?config.discovery.mode,
        lease_ttl_secs = config.lease_ttl.as_secs(),
        cache_bytes = config.cache_bytes,
        "starting beach-cache"
    );
    metrics::BOOT_COUNTER.inc();

    let (store, source, refresh) = match &config.discovery.mode {
        DiscoveryMode::Coordinated {
            redis_url,
            namespace,
        } => {
            let store: Arc<dyn CoordinationStore> = Arc::new(
                RedisCoordinator::connect(redis_url, namespace)
                    .await
                    .context("failed to connect to redis coordination store")?,
            );
            (store.clone(), AddressSource::Coordinated(store), true)
        }
        DiscoveryMode::Static { peers } => {
            // Static peers are fixed; registration still runs so the node's
            // lifecycle is the same in both modes.
            let store: Arc<dyn CoordinationStore> = MemoryCoordinator::new();
            let mut addrs = peers.clone();
            addrs.push(config.advertise_addr.clone());
            let source = AddressSource::fixed(&config.discovery.service_prefix, addrs);
            (store, source, false)
        }
    };

    let resolver = PeerResolver::new(source, config.discovery.dial_timeout);
    let ring = PeerRing::new(peer_id.clone(), resolver, config.discovery.fetch_timeout);
    if let DiscoveryMode::Static { peers } = &config.discovery.mode {
        ring.set_peers(
            peers
                .iter()
                .map(|addr| beach_cache::config::peer_id(&config.discovery.service_prefix, addr)),
        );
    }

    let rows = match &config.source {
        Some(path) => source::read_table(path)?,
        None => source::demo_scores(),
    };
    let groups = GroupRegistry::new();
    let scores = groups.insert(Group::with_capacity(
        "scores",
        config.cache_bytes,
        Arc::new(TableLoader::new("scores", rows)),
    ));
    scores
        .register_peers(ring.clone())
        .context("failed to attach peers to the scores group")?;

    let mut registration = Registration::spawn(Registrar::new(
        store.clone(),
        peer_id.clone(),
        config.advertise_addr.clone(),
        config.lease_ttl,
    ));
    let refresher = refresh.then(|| {
        ring::spawn_membership_refresh(
            ring.clone(),
            store.clone(),
            config.discovery.service_prefix.clone(),
            config.membership_refresh,
        )
    });

    let app = routes::router(AppState::new(peer_id.clone(), groups, Some(ring)));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("beach-cache listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!("shutdown signal received; leaving the peer set");
    if let Some(refresher) = refresher {
        refresher.abort();
    }
    registration.stop(None);
    if let Err(err) = registration.join().await {
        warn!(error = %err, "registration ended with error");
    }
    store.close();
    info!("graceful shutdown complete");
    Ok(())
}

async fn get_once(args: GetArgs) -> Result<()> {
    let GetArgs {
        service,
        group,
        key,
        discovery,
    } = args;
    let discovery = DiscoveryConfig::try_from(discovery)?;
    let source = match discovery.mode {
        DiscoveryMode::Coordinated {
            redis_url,
            namespace,
        } => AddressSource::Coordinated(Arc::new(
            RedisCoordinator::connect(&redis_url, &namespace)
                .await
                .context("failed to connect to redis coordination store")?,
        )),
        DiscoveryMode::Static { peers } => AddressSource::fixed(&discovery.service_prefix, peers),
    };

    let resolver = PeerResolver::new(source, discovery.dial_timeout);
    let channel = resolver.resolve(&service).await?;
    let value = client::fetch(&channel, &group, &key, discovery.fetch_timeout).await?;
    println!("{}", String::from_utf8_lossy(&value));
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
