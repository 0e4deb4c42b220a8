#[cfg(feature = "rest-api")]
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cass_access_operator::{
    controller::{self, ApplierConfig, OperatorConfig},
    crd::CassandraAccessPolicy,
    retry::RetryConfig,
    telemetry,
    topology::SnapshotReaderConfig,
    Error,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show managed access policies
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Operator namespace
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Run in dry-run mode (calculate changes without applying them)
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    /// Bound on a single route operation, in seconds
    #[arg(long, env = "ROUTE_OP_TIMEOUT_SECS", default_value_t = 15)]
    op_timeout_secs: u64,

    /// How long a new route may take to start serving, in seconds
    #[arg(long, env = "ROUTE_CONFIRM_TIMEOUT_SECS", default_value_t = 120)]
    confirm_timeout_secs: u64,

    /// Attempts per route operation before it is reported failed
    #[arg(long, env = "ROUTE_RETRY_ATTEMPTS", default_value_t = 3)]
    retry_attempts: u32,

    /// Consecutive topology read failures before serving the last-known-good snapshot
    #[arg(long, env = "SNAPSHOT_FAILURE_CEILING", default_value_t = 5)]
    snapshot_failure_ceiling: u32,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Listen address of the REST API
    #[cfg(feature = "rest-api")]
    #[arg(long, env = "REST_API_BIND", default_value = cass_access_operator::rest_api::DEFAULT_BIND_ADDRESS)]
    rest_api_bind: SocketAddr,
}

impl RunArgs {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            dry_run: self.dry_run,
            applier: ApplierConfig {
                op_timeout: Duration::from_secs(self.op_timeout_secs),
                confirm_timeout: Duration::from_secs(self.confirm_timeout_secs),
                retry: RetryConfig::with_max_attempts(self.retry_attempts),
                ..Default::default()
            },
            snapshot: SnapshotReaderConfig {
                failure_ceiling: self.snapshot_failure_ceiling.max(1),
                ..Default::default()
            },
        }
    }
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace to list; all namespaces when omitted
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("cass-access-operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;

    let api: Api<CassandraAccessPolicy> = match &args.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let policies = api.list(&Default::default()).await?;

    println!("Managed access policies: {}", policies.items.len());
    for p in &policies.items {
        let status = p.status.clone().unwrap_or_default();
        println!(
            "  {}/{}  cluster={} mode={} phase={} activeRoutes={}{}",
            p.namespace().unwrap_or_default(),
            p.name_any(),
            p.spec.cluster_name,
            p.spec.mode,
            if status.phase.is_empty() { "Unknown" } else { &status.phase },
            status.active_routes,
            if status.topology_degraded { " (degraded)" } else { "" }
        );
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = if json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Only enable OTEL if an endpoint is provided
    match telemetry::otlp_endpoint() {
        Some(endpoint) => match telemetry::init_telemetry(&endpoint) {
            Ok(otel_layer) => {
                registry.with(otel_layer).init();
                info!("OpenTelemetry tracing initialized ({})", endpoint);
            }
            Err(e) => {
                registry.init();
                warn!("OpenTelemetry tracing disabled: {}", e);
            }
        },
        None => {
            registry.init();
            info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
        }
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_json);

    info!(
        "Starting cass-access-operator v{}",
        env!("CARGO_PKG_VERSION")
    );
    if args.dry_run {
        info!("Dry-run mode: plans are logged, nothing is applied");
    }

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    // Leader election configuration
    let leader_namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
    let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });

    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));

    {
        let lease_client = client.clone();
        let lease_ns = leader_namespace.clone();
        let identity = holder_identity.clone();
        let is_leader_bg = Arc::clone(&is_leader);

        tokio::spawn(async move {
            run_leader_election(lease_client, &lease_ns, &identity, is_leader_bg).await;
        });
    }

    let state = Arc::new(controller::ControllerState::new(
        client.clone(),
        args.operator_config(),
        Arc::clone(&is_leader),
    ));

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let bind = args.rest_api_bind;
        tokio::spawn(async move {
            if let Err(e) = cass_access_operator::rest_api::run_server(api_state, bind).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    // Run the main controller loop
    let result = controller::run_controller(state).await;

    // Flush any remaining traces
    telemetry::shutdown_telemetry();

    result
}

const LEASE_NAME: &str = "cass-access-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.swap(true, Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.swap(false, Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let existing = match leases.get_opt(LEASE_NAME).await? {
        Some(lease) => lease,
        None => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(k8s_openapi::api::coordination::v1::LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            return Ok(true);
        }
    };

    let spec = existing.spec.as_ref();
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

    if current_holder == Some(identity) {
        let patch = serde_json::json!({
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        });
        leases
            .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        return Ok(true);
    }

    let expired = spec
        .and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration as i64)
        })
        .unwrap_or(true);

    if !expired {
        return Ok(false);
    }

    info!(
        "Lease held by {:?} has expired, taking over",
        current_holder
    );
    // resourceVersion makes the takeover fail if another replica got there first
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": existing.resource_version() },
        "spec": {
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    });
    match leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
        Err(e) => Err(e),
    }
}
