use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use kubelive_api::InProcApi;
use kubelive_core::{ResourceKind, DEFAULT_NAMESPACE};
use kubelive_hub::{Hub, HubConfig};
use kubelive_kubehub::{ClusterClient, DriverSet, KubeClient, WatchConfig};
use kubelive_server::{LiveServer, ServerConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kubelive", version, about = "Live view of a namespace's workloads over HTTP and WebSocket")]
struct Cli {
    /// Path to one kubeconfig file (default: inferred, honouring a KUBECONFIG path list)
    #[arg(long = "kubeconfig", env = "KUBELIVE_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Address to listen on
    #[arg(long = "listen", env = "KUBELIVE_LISTEN", default_value = "0.0.0.0:5000")]
    listen: SocketAddr,

    /// Send a `<kind>-synced` message with the full list after every (re)list
    #[arg(long = "announce-sync", env = "KUBELIVE_ANNOUNCE_SYNC", action = ArgAction::SetTrue)]
    announce_sync: bool,
}

fn init_tracing() {
    let env = std::env::var("KUBELIVE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBELIVE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KUBELIVE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Explicit path, else `$HOME/.kube/config` when present, else let kube infer.
/// A set `KUBECONFIG` may list several files, so it is always left to kube's inference.
fn resolve_kubeconfig(explicit: Option<PathBuf>, kubeconfig_env_set: bool) -> Option<PathBuf> {
    explicit.or_else(|| {
        if kubeconfig_env_set {
            return None;
        }
        let home = std::env::var_os("HOME")?;
        let path = PathBuf::from(home).join(".kube").join("config");
        path.exists().then_some(path)
    })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    init_metrics();

    let kubeconfig = resolve_kubeconfig(cli.kubeconfig, std::env::var_os("KUBECONFIG").is_some());
    let client: Arc<dyn ClusterClient> = Arc::new(
        KubeClient::connect(kubeconfig.as_deref(), DEFAULT_NAMESPACE).await.context("connecting to the cluster")?,
    );

    let hub = Arc::new(Hub::new(HubConfig { announce_sync: cli.announce_sync, ..HubConfig::from_env() }));
    let drivers = DriverSet::start(&ResourceKind::WATCHED, Arc::clone(&client), hub.clone(), WatchConfig::from_env());

    let api = Arc::new(InProcApi::new(Arc::clone(&client)));
    let server = LiveServer::new(ServerConfig::new(cli.listen), api, Arc::clone(&hub));
    let stop = CancellationToken::new();
    let mut server_task = tokio::spawn({
        let stop = stop.clone();
        async move { server.serve_with_shutdown(async move { stop.cancelled().await }).await }
    });

    let early = tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "installing ctrl-c handler failed");
            }
            info!("shutdown requested");
            None
        }
        res = &mut server_task => Some(res),
    };

    drivers.shutdown().await;
    hub.shutdown();
    stop.cancel();

    let res = match early {
        Some(res) => res,
        None => server_task.await,
    };
    res.context("server task panicked")?.context("serving HTTP")?;
    info!("bye");
    Ok(())
}
