use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pathnet::{
    default_registry, generate_signing_key, verifying_key_from_hex, Addr, DaemonClient,
    DaemonClientConfig, DefaultSegmentHandler, Ia, IfId, IfInfo, LinkType, MemRevCache,
    MemSegmentStore, NetworkContext, PathResolver, PathServer, SegmentFetcher, ServerConfig,
    ServiceAddr, ServiceType, Timers, Topology, TopologyHandle, TopologyInspector, TrustStore,
    UdpDispatcher, DEFAULT_MTU,
};

/// Interval between purges of expired segments and revocations.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Local interface: `IFID,INTERNAL_ADDR,REMOTE_IA,LINK_TYPE`.
#[derive(Clone, Debug)]
struct InterfaceArg {
    ifid: IfId,
    info: IfInfo,
}

impl FromStr for InterfaceArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').collect();
        let [ifid, internal, remote, link] = parts.as_slice() else {
            anyhow::bail!("interface must be IFID,INTERNAL_ADDR,REMOTE_IA,LINK_TYPE");
        };
        let ifid: IfId = ifid.parse().context("invalid interface id")?;
        let internal_addr: SocketAddr = internal.parse().context("invalid internal address")?;
        let remote_ia: Ia = remote.parse().context("invalid remote IA")?;
        let link_type = match link.to_ascii_lowercase().as_str() {
            "core" => LinkType::Core,
            "parent" => LinkType::Parent,
            "child" => LinkType::Child,
            "peer" => LinkType::Peer,
            other => anyhow::bail!("unknown link type {:?}", other),
        };
        Ok(InterfaceArg {
            ifid,
            info: IfInfo {
                internal_addr,
                remote_ia,
                link_type,
                mtu: DEFAULT_MTU,
            },
        })
    }
}

/// Trusted signer: `IA=HEX_PUBLIC_KEY`.
#[derive(Clone, Debug)]
struct TrustAnchor {
    ia: Ia,
    key: ed25519_dalek::VerifyingKey,
}

impl FromStr for TrustAnchor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ia, key) = s
            .split_once('=')
            .context("trust anchor must be IA=HEX_PUBLIC_KEY")?;
        let ia: Ia = ia.parse().context("invalid IA")?;
        let key = verifying_key_from_hex(key).context("invalid public key")?;
        Ok(TrustAnchor { ia, key })
    }
}

#[derive(Parser, Debug)]
#[command(name = "pathnet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a path server for the local scope
    Serve(ServeArgs),
    /// Look up paths through a path server
    Paths(PathsArgs),
    /// Generate an Ed25519 signing key for revocations and segments
    Keygen,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    ia: Ia,

    #[arg(long)]
    core: bool,

    #[arg(short, long, default_value = "127.0.0.1:30252")]
    listen: SocketAddr,

    #[arg(long, default_value_t = DEFAULT_MTU)]
    mtu: u16,

    #[arg(short = 'i', long = "interface", value_name = "IFACE")]
    interfaces: Vec<InterfaceArg>,

    #[arg(short = 't', long = "trust", value_name = "ANCHOR")]
    trust: Vec<TrustAnchor>,

    #[arg(long, default_value = "300")]
    service_ttl: u32,
}

#[derive(Args, Debug)]
struct PathsArgs {
    #[arg(long)]
    local_ia: Ia,

    #[arg(long, default_value = "127.0.0.1:0")]
    local: SocketAddr,

    /// Overlay address of the local path server
    #[arg(short, long, default_value = "127.0.0.1:30252")]
    server: SocketAddr,

    #[arg(short, long)]
    dst: Ia,

    #[arg(short, long, default_value = "10")]
    max: u16,

    #[arg(long)]
    refresh: bool,

    /// Seconds to wait for the path server
    #[arg(long, default_value = "5")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Paths(args) => paths(args).await,
        Command::Keygen => {
            let key = generate_signing_key();
            println!("public: {}", hex::encode(key.verifying_key().as_bytes()));
            println!("secret: {}", hex::encode(key.to_bytes()));
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut topo = Topology::new(args.ia, args.core)
        .with_mtu(args.mtu)
        .with_service(ServiceType::PathServer, args.listen);
    for iface in args.interfaces {
        topo = topo.with_interface(iface.ifid, iface.info);
    }
    let topo = TopologyHandle::new(topo);
    let trust = Arc::new(
        args.trust
            .into_iter()
            .fold(TrustStore::new(), |store, anchor| store.with_key(anchor.ia, anchor.key)),
    );
    let store = Arc::new(MemSegmentStore::new());
    let revocations = Arc::new(MemRevCache::new());

    let config = ServerConfig {
        service_ttl: args.service_ttl,
        ..ServerConfig::default()
    };
    let server = PathServer::new(
        config,
        topo.clone(),
        Arc::new(SegmentFetcher::new(topo.clone(), store.clone(), revocations.clone())),
        Arc::new(TopologyInspector::new(topo.clone())),
        trust.clone(),
        revocations.clone(),
        Arc::new(DefaultSegmentHandler::new(trust, store.clone(), revocations.clone())),
    );

    let ctx = NetworkContext::new(args.ia, Arc::new(UdpDispatcher::new()), None);
    let ctx = default_registry()
        .initialize(ctx)
        .context("default network context")?;
    let local = Addr::udp(args.ia, args.listen);
    let conn = ctx
        .listen_with_bind_svc("udp4", Some(&local), None, ServiceAddr::PathServer, Duration::from_secs(5))
        .await
        .context("failed to open path server socket")?;
    info!("Path server for {} on {}", args.ia, conn.local_addr());
    info!("Upstream segment requests disabled; serving pushed segments only");

    let serve_task = tokio::spawn({
        let conn = conn.clone();
        async move { server.serve(conn).await }
    });

    let mut interval = time::interval(PURGE_INTERVAL);
    interval.tick().await; // Skip initial tick

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let segments = store.purge_expired().await;
                let revoked = revocations.purge_expired().await;
                info!(
                    segments_purged = segments,
                    revocations_purged = revoked,
                    segments = store.len().await,
                    "purged expired state"
                );
            }
        }
    }

    if let Err(e) = conn.close().await {
        warn!(error = %e, "closing path server socket");
    }
    match serve_task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e).context("path server failed"),
        Err(e) => Err(e).context("path server task failed"),
    }
}

async fn paths(args: PathsArgs) -> Result<()> {
    let timeout = Duration::from_secs(args.timeout);
    let dispatcher =
        UdpDispatcher::new().with_service(args.local_ia, ServiceAddr::PathServer, args.server);

    let bootstrap = NetworkContext::new(args.local_ia, Arc::new(dispatcher.clone()), None);
    let local = Addr::udp(args.local_ia, args.local);
    let remote = Addr::svc(args.local_ia, ServiceAddr::PathServer);
    let conn = bootstrap
        .dial("udp4", Some(&local), Some(&remote), timeout)
        .await
        .context("failed to reach path server")?;
    let daemon = DaemonClient::new(
        conn.clone(),
        DaemonClientConfig {
            request_timeout: timeout,
        },
    )
    .context("failed to start daemon client")?;

    let resolver = PathResolver::new(Arc::new(daemon), Timers::default());
    let ctx = NetworkContext::new(args.local_ia, Arc::new(dispatcher), Some(resolver.clone()));
    default_registry()
        .initialize(ctx)
        .context("default network context")?;

    let result = resolver
        .query(args.local_ia, args.dst, args.max, args.refresh)
        .await;
    resolver.quit().await;
    let _ = conn.close().await;

    let paths = result.with_context(|| format!("path lookup to {} failed", args.dst))?;
    if paths.is_empty() {
        println!("No paths to {}", args.dst);
        return Ok(());
    }
    println!("Available paths to {}", args.dst);
    for (i, path) in paths.iter().enumerate() {
        println!("[{:2}] {}", i, path);
    }
    Ok(())
}
