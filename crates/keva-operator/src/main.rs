//! Keva operator entrypoint
//!
//! Starts the lifecycle controller, the validating admission webhook, the
//! Prometheus metrics endpoint and a plain TCP health probe.

use anyhow::Context as _;
use clap::Parser;
use kube::{Client, CustomResourceExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use keva_operator::admission;
use keva_operator::controller::{self, Context, OperatorConfig};
use keva_operator::crd::{AppBinding, DormantDatabase, KevaDatabase, KevaVersion};
use keva_operator::dormant;

#[derive(Parser, Debug)]
#[command(name = "keva-operator", version, about = "Operator for Keva key-value databases")]
struct Args {
    /// Limit watches to a single namespace; watches all namespaces when unset
    #[arg(long, env = "KEVA_NAMESPACE")]
    namespace: Option<String>,

    /// Provision per-database ServiceAccounts, Roles and RoleBindings
    #[arg(long, env = "KEVA_ENABLE_RBAC", default_value_t = true)]
    enable_rbac: bool,

    /// Suffix of the governing (headless) service name
    #[arg(long, env = "KEVA_GOVERNING_SERVICE_SUFFIX", default_value = "pods")]
    governing_service_suffix: String,

    /// Override the tag of the catalog's metrics exporter image
    #[arg(long, env = "KEVA_EXPORTER_TAG")]
    exporter_tag: Option<String>,

    /// Address the admission webhook listens on
    #[arg(long, env = "KEVA_WEBHOOK_ADDR", default_value = "0.0.0.0:8443")]
    webhook_addr: SocketAddr,

    /// Address the Prometheus metrics endpoint listens on
    #[arg(long, env = "KEVA_METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// Address the health probe listens on
    #[arg(long, env = "KEVA_HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Run without the admission webhook (controller only)
    #[arg(long, env = "KEVA_DISABLE_WEBHOOK", default_value_t = false)]
    disable_webhook: bool,

    /// Log filter (e.g. "info", "keva_operator=debug")
    #[arg(long, env = "KEVA_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "KEVA_LOG_JSON", default_value_t = false)]
    log_json: bool,

    /// Print the CRD manifests to stdout and exit
    #[arg(long)]
    print_crd: bool,
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).context("invalid log filter")?;
    if args.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn print_crds() -> anyhow::Result<()> {
    let crds = [
        serde_yaml::to_string(&KevaDatabase::crd())?,
        serde_yaml::to_string(&DormantDatabase::crd())?,
        serde_yaml::to_string(&AppBinding::crd())?,
        serde_yaml::to_string(&KevaVersion::crd())?,
    ];
    println!("{}", crds.join("---\n"));
    Ok(())
}

/// Minimal HTTP 200 responder for liveness and readiness probes
async fn run_health_server(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind health server")?;
    info!(%addr, "health server listening");
    loop {
        let (mut stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await;
            let _ = stream.shutdown().await;
        });
    }
}

async fn run_webhook_server(addr: SocketAddr, client: Client) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind webhook server")?;
    info!(%addr, "admission webhook listening");
    axum::serve(listener, admission::router(client))
        .await
        .context("webhook server exited")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crd {
        return print_crds();
    }

    init_logging(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = args.namespace.as_deref().unwrap_or("<all>"),
        "starting keva-operator"
    );

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_addr)
        .install()
        .context("failed to install metrics exporter")?;

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr).await {
            error!(error = %e, "health server failed");
        }
    });

    if !args.disable_webhook {
        let webhook_client = client.clone();
        let webhook_addr = args.webhook_addr;
        tokio::spawn(async move {
            if let Err(e) = run_webhook_server(webhook_addr, webhook_client).await {
                error!(error = %e, "webhook server failed");
            }
        });
    }

    let config = OperatorConfig {
        rbac_enabled: args.enable_rbac,
        governing_service_suffix: args.governing_service_suffix.clone(),
        exporter_tag: args.exporter_tag.clone(),
    };
    let ctx = Arc::new(Context::new(client.clone(), "keva-operator", config));
    tokio::try_join!(
        controller::run(ctx, args.namespace.as_deref()),
        dormant::run(client, args.namespace.as_deref()),
    )?;

    info!("controllers stopped, shutting down");
    Ok(())
}
