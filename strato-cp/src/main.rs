use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use strato_cp::audit::AuditLogger;
use strato_cp::config::Config;
use strato_cp::model::SchedulingPolicy;
use strato_cp::nodeclient::loopback::LoopbackFabric;
use strato_cp::rest::create_router;
use strato_cp::server::{ControlPlane, make_connector, make_store, seed_dev_fleet};

#[derive(Parser)]
#[command(name = "strato-cp")]
#[command(about = "strato control plane - declarative virtualization cluster manager")]
struct Args {
    /// Listen address for the REST API
    #[arg(short, long, default_value = "[::]:8080")]
    listen: String,

    /// Object store endpoint ("memory" for the in-process store)
    #[arg(long, default_value = "memory")]
    store: String,

    /// Leader lease TTL in seconds
    #[arg(long, default_value_t = 15)]
    lease_ttl_secs: u64,

    /// Per-pass reconcile deadline in seconds
    #[arg(long, default_value_t = 30)]
    reconcile_timeout_secs: u64,

    /// Node RPC deadline in seconds
    #[arg(long, default_value_t = 15)]
    rpc_timeout_secs: u64,

    /// Default placement policy (balanced | packed)
    #[arg(long, default_value = "balanced")]
    scheduler_policy: String,

    /// Node liveness lease TTL in seconds
    #[arg(long, default_value_t = 10)]
    alive_ttl_secs: u64,

    /// Liveness-expiry-to-fence window in seconds
    #[arg(long, default_value_t = 30)]
    fence_secs: u64,

    /// Run in development mode (in-memory store, loopback hypervisors)
    #[arg(long)]
    dev: bool,

    /// Number of simulated hosts in dev mode
    #[arg(long, default_value_t = 2)]
    dev_nodes: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("strato_cp=info".parse()?))
        .init();

    let args = Args::parse();
    let cfg = Config {
        listen: args.listen.clone(),
        store: args.store,
        lease_ttl: Duration::from_secs(args.lease_ttl_secs),
        reconcile_timeout: Duration::from_secs(args.reconcile_timeout_secs),
        rpc_timeout: Duration::from_secs(args.rpc_timeout_secs),
        default_policy: match args.scheduler_policy.as_str() {
            "packed" => SchedulingPolicy::Packed,
            _ => SchedulingPolicy::Balanced,
        },
        t_alive: Duration::from_secs(args.alive_ttl_secs),
        t_fence: Duration::from_secs(args.fence_secs),
        dev: args.dev,
        dev_nodes: args.dev_nodes,
        ..Default::default()
    };

    info!(
        "Starting strato-cp - REST: {}, store: {}, dev: {}",
        cfg.listen, cfg.store, cfg.dev
    );

    let kv = make_store(&cfg)?;
    let fabric = cfg.dev.then(LoopbackFabric::new);
    let connector = make_connector(&cfg, fabric.clone());
    let audit = Arc::new(AuditLogger::new());

    let cp = ControlPlane::start(&cfg, kv, connector, audit).await?;

    // Dev mode brings its own fleet so the full reconcile path works out of
    // the box.
    let (fleet_shutdown_tx, fleet_shutdown_rx) = watch::channel(false);
    if let Some(fabric) = fabric {
        let fleet = seed_dev_fleet(&cp, fabric, cfg.dev_nodes, fleet_shutdown_rx).await?;
        info!(
            "dev fleet: {} nodes in cluster '{}', join token {}",
            fleet.nodes.len(),
            fleet.cluster.meta.name,
            fleet.token
        );
    }

    let router = create_router(cp.state.clone());
    let listener = tokio::net::TcpListener::bind(&cfg.listen).await?;
    info!("REST API listening on {}", cfg.listen);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let rest_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await
    });

    let ctrl_c = signal::ctrl_c();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    let _ = shutdown_tx.send(true);
    let _ = fleet_shutdown_tx.send(true);
    let _ = rest_handle.await;
    cp.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}
