use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_controller::{Aggregator, ControllerConfig, Reconciler, ResourceController};
use warden_core::{Object, ResourceKey};
use warden_kubehub::{dynamic_source, KubeListWatch};
use warden_store::WatchCache;

#[derive(Parser, Debug)]
#[command(name = "wardend", version, about = "Warden controller daemon")]
struct Cli {
    /// Restrict watches to one namespace (default: all namespaces)
    #[arg(short = 'n', long = "namespace", env = "WARDEN_NAMESPACE")]
    namespace: Option<String>,

    /// Workers per controller
    #[arg(long = "workers")]
    workers: Option<usize>,

    /// Retries before a failing key is dropped
    #[arg(long = "max-retries")]
    max_retries: Option<u32>,

    /// Periodic resync in seconds (0 disables)
    #[arg(long = "resync-secs")]
    resync_secs: Option<u64>,

    /// Give up when caches have not synced after this many seconds
    #[arg(long = "sync-timeout-secs")]
    sync_timeout_secs: Option<u64>,

    /// Label selector applied to every watch
    #[arg(short = 'l', long = "label-selector")]
    label_selector: Option<String>,

    /// Built-in kinds to run controllers for
    #[arg(long = "kinds", value_enum, value_delimiter = ',', default_values_t = vec![Kind::Services, Kind::Endpoints])]
    kinds: Vec<Kind>,

    /// Extra kind to watch, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate" (repeatable)
    #[arg(long = "watch", value_name = "GVK")]
    watch: Vec<String>,

    /// Print the resolved configuration as JSON and exit
    #[arg(long = "print-config", action = ArgAction::SetTrue)]
    print_config: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kind { Services, Endpoints }

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Kind::Services => "services",
            Kind::Endpoints => "endpoints",
        }
    }
}

#[derive(Serialize)]
struct Resolved<'a> {
    namespace: Option<&'a str>,
    label_selector: Option<&'a str>,
    kinds: Vec<&'static str>,
    watch: &'a [String],
    controller: &'a ControllerConfig,
}

impl Cli {
    /// Environment defaults, overridden by flags.
    fn controller_config(&self) -> Result<ControllerConfig> {
        let mut cfg = ControllerConfig::from_env().context("reading WARDEN_* settings")?;
        if let Some(n) = self.workers {
            cfg.workers = n;
        }
        if let Some(n) = self.max_retries {
            cfg.max_retries = n;
        }
        if let Some(s) = self.resync_secs {
            cfg.resync_period = if s == 0 { None } else { Some(Duration::from_secs(s)) };
        }
        if let Some(s) = self.sync_timeout_secs {
            cfg.sync_timeout = Duration::from_secs(s);
        }
        Ok(cfg)
    }

    fn resolved<'a>(&'a self, cfg: &'a ControllerConfig) -> Resolved<'a> {
        Resolved {
            namespace: self.namespace.as_deref(),
            label_selector: self.label_selector.as_deref(),
            kinds: self.kinds.iter().map(|k| k.name()).collect(),
            watch: &self.watch,
            controller: cfg,
        }
    }
}

fn init_tracing() {
    let env = std::env::var("WARDEN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("WARDEN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid WARDEN_METRICS_ADDR; expected host:port");
        }
    }
}

/// Reconciler that only reports what the cache holds for the key.
struct LogReconciler {
    kind: String,
}

impl LogReconciler {
    fn new(kind: impl Into<String>) -> Self { Self { kind: kind.into() } }
}

#[async_trait::async_trait]
impl<K: Object> Reconciler<K> for LogReconciler {
    async fn reconcile(&self, key: &ResourceKey, cache: &WatchCache<K>) -> Result<()> {
        match cache.get(key) {
            Some(obj) => info!(kind = %self.kind, key = %key, rv = ?obj.resource_version(), "reconciled"),
            None => info!(kind = %self.kind, key = %key, "reconciled deletion"),
        }
        Ok(())
    }
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn typed_source<K>(client: &Client, cli: &Cli, name: &str) -> KubeListWatch<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    let src = KubeListWatch::new(api::<K>(client, cli.namespace.as_deref()), name);
    match cli.label_selector.as_deref() {
        Some(sel) => src.labels(sel),
        None => src,
    }
}

async fn build(client: Client, cli: &Cli, cfg: &ControllerConfig) -> Result<Aggregator> {
    let mut agg = Aggregator::new();
    for kind in &cli.kinds {
        match kind {
            Kind::Services => {
                let src = typed_source::<Service>(&client, cli, kind.name());
                agg.add(ResourceController::new(kind.name(), src, LogReconciler::new("Service"), cfg.clone()), cfg.workers);
            }
            Kind::Endpoints => {
                let src = typed_source::<Endpoints>(&client, cli, kind.name());
                agg.add(ResourceController::new(kind.name(), src, LogReconciler::new("Endpoints"), cfg.clone()), cfg.workers);
            }
        }
    }
    for gvk in &cli.watch {
        let mut src = dynamic_source(client.clone(), gvk, cli.namespace.as_deref())
            .await
            .with_context(|| format!("resolving {}", gvk))?;
        if let Some(sel) = cli.label_selector.as_deref() {
            src = src.labels(sel);
        }
        agg.add(ResourceController::new(gvk.clone(), src, LogReconciler::new(gvk.clone()), cfg.clone()), cfg.workers);
    }
    Ok(agg)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM; Ctrl-C only");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

/// First signal stops the controllers gracefully; a second one exits at once.
fn spawn_signal_handler(stop: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received; draining controllers (repeat to force exit)");
        stop.cancel();
        shutdown_signal().await;
        warn!("second shutdown signal; exiting immediately");
        std::process::exit(1);
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = cli.controller_config()?;
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&cli.resolved(&cfg))?);
        return Ok(());
    }
    init_metrics();

    let client = Client::try_default().await.context("connecting to the cluster")?;
    let agg = build(client, &cli, &cfg).await?;
    if agg.is_empty() {
        bail!("nothing to watch: pass --kinds or --watch");
    }
    info!(controllers = agg.len(), namespace = ?cli.namespace, workers = cfg.workers, "wardend starting");

    let stop = CancellationToken::new();
    spawn_signal_handler(stop.clone());
    let barrier = agg.barrier();
    tokio::spawn(async move {
        barrier.wait().await;
        info!(controllers = barrier.expected(), "all caches synced; controllers ready");
    });
    agg.run(stop).await?;
    info!("wardend stopped");
    Ok(())
}
