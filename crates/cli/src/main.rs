use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fleet_api::{CacheConfig, CachedObject, ClusterRegistry, ClusterStatus, ConnectionInfo, FleetApi};
use fleet_kubehub::{discover, Connector, KubeConnector};
use serde::Deserialize;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fleetctl", version, about = "Fleet multi-cluster cache CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace filter (ignored for cluster-scoped kinds)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Kubeconfig file (default: inferred from the environment)
    #[arg(long = "kubeconfig", global = true, env = "FLEET_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long = "context", global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resource types and report failed groups
    Discover,
    /// List cached objects of a kind
    Ls {
        /// Kind in any spelling: pod, pods, Pod, deployments.apps
        kind: String,
        /// Label selector, e.g. "app=web,tier in (fe,be)"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        /// How long to wait for the first sync
        #[arg(long = "wait-secs", env = "FLEET_WAIT_SECS", default_value_t = 30)]
        wait_secs: u64,
    },
    /// Print one cached object as JSON
    Get {
        kind: String,
        name: String,
        #[arg(long = "wait-secs", env = "FLEET_WAIT_SECS", default_value_t = 30)]
        wait_secs: u64,
    },
    /// Register every cluster of a file and keep their caches warm until Ctrl-C
    Serve {
        /// YAML file with a `clusters:` list of `{ id, connection }`
        #[arg(long = "clusters")]
        clusters: PathBuf,
        /// Interval between status reports
        #[arg(long = "status-secs", env = "FLEET_STATUS_SECS", default_value_t = 30)]
        status_secs: u64,
    },
}

#[derive(Debug, Deserialize)]
struct ClusterFile {
    clusters: Vec<ClusterEntry>,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    id: String,
    connection: ConnectionInfo,
}

fn init_tracing() {
    let env = std::env::var("FLEET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FLEET_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FLEET_METRICS_ADDR; expected host:port");
        }
    }
}

fn connection_info(cli: &Cli) -> ConnectionInfo {
    match (&cli.kubeconfig, &cli.context) {
        (Some(path), context) => ConnectionInfo::KubeconfigPath { path: path.display().to_string(), context: context.clone() },
        (None, Some(context)) => {
            let home = std::env::var("HOME").unwrap_or_default();
            ConnectionInfo::KubeconfigPath { path: format!("{}/.kube/config", home), context: Some(context.clone()) }
        }
        (None, None) => ConnectionInfo::Infer,
    }
}

/// Cluster id used by the single-cluster commands.
fn local_id(cli: &Cli) -> String {
    cli.context.clone().unwrap_or_else(|| "local".to_string())
}

fn render_age(obj: &CachedObject) -> String {
    let created = obj
        .payload
        .pointer("/metadata/creationTimestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (chrono::Utc::now().timestamp() - created.timestamp()).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

fn print_status(status: &ClusterStatus, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            let degraded = status.types.values().filter(|h| h.phase == fleet_api::SyncPhase::Degraded).count();
            println!(
                "{:<16} {:<10} types={:<4} objects={:<7} degraded={:<3} failed_groups={} {}",
                status.id,
                format!("{:?}", status.state),
                status.types.len(),
                status.objects(),
                degraded,
                status.discovery_failures.len(),
                status.last_error.as_deref().unwrap_or("")
            );
        }
        Output::Json => println!("{}", serde_json::to_string(status)?),
    }
    Ok(())
}

async fn single_cluster(cli: &Cli) -> Result<(ClusterRegistry, String)> {
    let registry = ClusterRegistry::kube(CacheConfig::from_env());
    let id = local_id(cli);
    registry.register_cluster(&id, connection_info(cli)).await?;
    Ok((registry, id))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Discover => {
            let cfg = CacheConfig::from_env();
            let id = local_id(&cli);
            info!(cluster = %id, "discover invoked");
            let source = KubeConnector::new().connect(&id, &connection_info(&cli)).await.context("connect")?;
            let found = discover(&id, &*source, cfg.request_timeout).await.context("discovery")?;
            match cli.output {
                Output::Human => {
                    for d in &found.descriptors {
                        let scope = if d.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {} • {}", d.api_version(), d.kind, d.plural, scope);
                    }
                    for f in &found.failures {
                        eprintln!("group '{}' failed: {}", f.group, f.reason);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&found)?),
            }
        }
        Commands::Ls { kind, selector, wait_secs } => {
            let ns = cli.namespace.as_deref();
            info!(kind = %kind, ns = ?ns, "ls invoked");
            let t0 = Instant::now();
            let (registry, id) = single_cluster(&cli).await?;
            let res = async {
                registry.wait_for_kind(&id, kind, Duration::from_secs(*wait_secs)).await?;
                registry.list(&id, kind, ns, selector.as_deref()).await
            }
            .await;
            registry.shutdown().await;
            let items = res.with_context(|| format!("listing {}", kind))?;
            info!(items = items.len(), took_ms = %t0.elapsed().as_millis(), "ls done");
            match cli.output {
                Output::Human => {
                    println!("{:<20} {:<40} {:<10} AGE", "NAMESPACE", "NAME", "VERSION");
                    for item in &items {
                        let ns_col = item.namespace.as_deref().unwrap_or("-");
                        println!("{:<20} {:<40} {:<10} {}", ns_col, item.name, item.token, render_age(item));
                    }
                }
                Output::Json => {
                    let items: Vec<&CachedObject> = items.iter().map(|o| &**o).collect();
                    println!("{}", serde_json::to_string_pretty(&items)?);
                }
            }
        }
        Commands::Get { kind, name, wait_secs } => {
            let ns = cli.namespace.as_deref();
            info!(kind = %kind, name = %name, ns = ?ns, "get invoked");
            let (registry, id) = single_cluster(&cli).await?;
            let res = async {
                registry.wait_for_kind(&id, kind, Duration::from_secs(*wait_secs)).await?;
                registry.get(&id, kind, ns, name).await
            }
            .await;
            registry.shutdown().await;
            let obj = res.with_context(|| format!("getting {} {}", kind, name))?;
            match cli.output {
                Output::Human => println!("{}", serde_json::to_string_pretty(&obj.payload)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&*obj)?),
            }
        }
        Commands::Serve { clusters, status_secs } => {
            let raw = std::fs::read_to_string(clusters).with_context(|| format!("reading {}", clusters.display()))?;
            let file: ClusterFile = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", clusters.display()))?;
            let registry = ClusterRegistry::kube(CacheConfig::from_env());
            for entry in file.clusters {
                if let Err(e) = registry.register_cluster(&entry.id, entry.connection).await {
                    warn!(cluster = %entry.id, error = %e, "register failed");
                }
            }
            info!(clusters = registry.clusters().await.len(), "serving; Ctrl-C to stop");
            let mut tick = tokio::time::interval(Duration::from_secs((*status_secs).max(1)));
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => break,
                    _ = tick.tick() => {
                        for id in registry.clusters().await {
                            match registry.cluster_status(&id).await {
                                Ok(status) => print_status(&status, cli.output)?,
                                Err(e) => warn!(cluster = %id, error = %e, "status unavailable"),
                            }
                        }
                    }
                }
            }
            info!("shutting down");
            registry.shutdown().await;
        }
    }

    Ok(())
}
