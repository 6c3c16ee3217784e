use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

pub const DEFAULT_LOG_FILTER: &str = "info,beach_cache=debug";

#[derive(Debug, Parser)]
#[command(
    name = "beach-cache",
    author,
    version,
    about = "Peer-to-peer read-through cache node"
)]
pub struct Cli {
    /// Tracing filter directives.
    #[arg(long, env = "RUST_LOG", default_value = DEFAULT_LOG_FILTER, global = true)]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

impl Cli {
    /// The subcommand to run; bare invocation means `serve`.
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Serve(self.serve))
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a cache node (default).
    Serve(ServeArgs),
    /// Ask one peer for a single key and print the value.
    Get(GetArgs),
}

/// How a process finds the peers it talks to.
#[derive(Debug, Clone, Args)]
pub struct DiscoveryArgs {
    /// Prefix of every peer's service name (`<prefix>/<addr>`).
    #[arg(long, env = "BEACH_CACHE_SERVICE_PREFIX", default_value = "beach-cache")]
    pub service_prefix: String,

    /// Redis URL of the coordination store. Without it the static peer list is used.
    #[arg(long, env = "BEACH_CACHE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Key namespace inside Redis.
    #[arg(long, env = "BEACH_CACHE_REDIS_NAMESPACE", default_value = "beach-cache")]
    pub redis_namespace: String,

    /// Static peer addresses (`host:port`), used when no Redis URL is given.
    #[arg(long = "peer", env = "BEACH_CACHE_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// How long to keep dialing before a peer counts as unreachable.
    #[arg(long, env = "BEACH_CACHE_DIAL_TIMEOUT_MS", default_value_t = 5_000)]
    pub dial_timeout_ms: u64,

    /// Round-trip bound of one remote get.
    #[arg(long, env = "BEACH_CACHE_FETCH_TIMEOUT_MS", default_value_t = 10_000)]
    pub fetch_timeout_ms: u64,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address the peer endpoint binds to.
    #[arg(long, env = "BEACH_CACHE_LISTEN_ADDR", default_value = "127.0.0.1:9999")]
    pub listen_addr: String,

    /// Address other peers use to reach this node. Defaults to the listen address.
    #[arg(long, env = "BEACH_CACHE_ADVERTISE_ADDR")]
    pub advertise_addr: Option<String>,

    #[command(flatten)]
    pub discovery: DiscoveryArgs,

    /// Lease TTL of this node's registration.
    #[arg(long, env = "BEACH_CACHE_LEASE_TTL_SECS", default_value_t = 5)]
    pub lease_ttl_secs: u64,

    /// Byte budget of each group's local store (0 = unbounded).
    #[arg(long, env = "BEACH_CACHE_CACHE_BYTES", default_value_t = 2 << 10)]
    pub cache_bytes: usize,

    /// How often the peer set is re-read from the coordination store.
    #[arg(long, env = "BEACH_CACHE_MEMBERSHIP_REFRESH_SECS", default_value_t = 5)]
    pub membership_refresh_secs: u64,

    /// JSON object of key -> value backing the `scores` group. Built-in demo rows when unset.
    #[arg(long, env = "BEACH_CACHE_SOURCE")]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct GetArgs {
    /// Peer to ask, as `<prefix>/<addr>`.
    #[arg(long)]
    pub service: String,

    #[arg(long, default_value = "scores")]
    pub group: String,

    #[arg(long)]
    pub key: String,

    #[command(flatten)]
    pub discovery: DiscoveryArgs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMode {
    Coordinated {
        redis_url: String,
        namespace: String,
    },
    Static {
        peers: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub service_prefix: String,
    pub mode: DiscoveryMode,
    pub dial_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl TryFrom<DiscoveryArgs> for DiscoveryConfig {
    type Error = anyhow::Error;

    fn try_from(args: DiscoveryArgs) -> Result<Self, Self::Error> {
        let service_prefix = args.service_prefix.trim_end_matches('/').to_string();
        if service_prefix.is_empty() {
            bail!("service prefix must not be empty");
        }
        if args.dial_timeout_ms == 0 || args.fetch_timeout_ms == 0 {
            bail!("dial and fetch timeouts must be greater than zero");
        }
        let mode = match args.redis_url {
            Some(redis_url) => DiscoveryMode::Coordinated {
                redis_url,
                namespace: args.redis_namespace,
            },
            None => {
                let peers = args
                    .peers
                    .into_iter()
                    .map(|peer| peer.trim().to_string())
                    .filter(|peer| !peer.is_empty())
                    .map(|peer| validate_host_port(&peer).map(|_| peer))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                DiscoveryMode::Static { peers }
            }
        };
        Ok(Self {
            service_prefix,
            mode,
            dial_timeout: Duration::from_millis(args.dial_timeout_ms),
            fetch_timeout: Duration::from_millis(args.fetch_timeout_ms),
        })
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub advertise_addr: String,
    pub discovery: DiscoveryConfig,
    pub lease_ttl: Duration,
    pub cache_bytes: usize,
    pub membership_refresh: Duration,
    pub source: Option<PathBuf>,
}

impl NodeConfig {
    /// Service name this node registers under and is placed by.
    pub fn peer_id(&self) -> String {
        peer_id(&self.discovery.service_prefix, &self.advertise_addr)
    }
}

impl TryFrom<ServeArgs> for NodeConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        let advertise_addr = match args.advertise_addr {
            Some(addr) => {
                validate_host_port(&addr)?;
                addr
            }
            None => listen_addr.to_string(),
        };
        if args.lease_ttl_secs == 0 {
            bail!("lease ttl must be greater than zero");
        }
        if args.membership_refresh_secs == 0 {
            bail!("membership refresh interval must be greater than zero");
        }
        Ok(Self {
            listen_addr,
            advertise_addr,
            discovery: DiscoveryConfig::try_from(args.discovery)?,
            lease_ttl: Duration::from_secs(args.lease_ttl_secs),
            cache_bytes: args.cache_bytes,
            membership_refresh: Duration::from_secs(args.membership_refresh_secs),
            source: args.source,
        })
    }
}

pub fn peer_id(service_prefix: &str, addr: &str) -> String {
    format!("{service_prefix}/{addr}")
}

fn validate_host_port(addr: &str) -> anyhow::Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("address {addr} is not host:port"))?;
    if host.is_empty() {
        bail!("address {addr} has no host");
    }
    port.parse::<u16>()
        .with_context(|| format!("address {addr} has an invalid port"))?;
    Ok(())
}
