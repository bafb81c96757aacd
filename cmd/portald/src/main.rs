mod http;

use portal_build::context::{BuildContext, GitHosts};
use portal_build::logs::BuildLogStore;
use portal_k8s_util::client::{ClusterConfig, new_client};
use portal_operator::context::Context;
use portal_operator::ingress_sync::sync_student_ingress_tls;
use portal_operator::telemetry::{self, LogFormat};
use portal_resources::student::VolumeOptions;
use portal_store::MIGRATOR;
use portal_store::model::ProjectClass;

use std::sync::Arc;

use clap::{Parser, crate_authors, crate_description, crate_version};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "portald",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=warn,portal=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env)]
    log_format: LogFormat,

    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Use the in-cluster service account instead of a kubeconfig
    #[arg(long, default_value_t = false, env = "K8S_IN_CLUSTER")]
    k8s_in_cluster: bool,

    /// Explicit kubeconfig path; standard resolution applies when unset
    #[arg(long, env = "K8S_CONFIG_PATH")]
    kubeconfig: Option<String>,

    /// S3-compatible endpoint for build logs; archiving is disabled when unset
    #[arg(long, env = "MINIO_ENDPOINT")]
    object_store_endpoint: Option<String>,

    #[arg(long, default_value = "", env = "MINIO_ACCESS_KEY")]
    object_store_access_key: String,

    #[arg(long, default_value = "", env = "MINIO_SECRET_KEY")]
    object_store_secret_key: String,

    /// Bucket holding archived build logs
    #[arg(long, default_value = "hydrosim-platform", env = "MINIO_BUCKET")]
    object_store_bucket: String,

    /// Shared webhook secret; unsigned pushes are accepted when unset
    #[arg(long, env = "WEBHOOK_SECRET")]
    webhook_secret: Option<String>,

    /// Public URL of the git service, used to recognize SSH repo hosts
    #[arg(long, env = "GIT_URL")]
    git_url: Option<String>,

    /// Cluster-internal SSH host of the git service
    #[arg(long, env = "GIT_SSH_INTERNAL_HOST")]
    git_ssh_internal_host: Option<String>,

    #[arg(long, env = "GIT_SSH_INTERNAL_PORT")]
    git_ssh_internal_port: Option<u16>,

    /// TLS secret shared by student ingresses; plain HTTP when unset
    #[arg(long, env = "STUDENT_TLS_SECRET_NAME")]
    tls_secret_name: Option<String>,

    /// Provision a PersistentVolumeClaim per student workload
    #[arg(long, default_value_t = true, env = "STUDENT_PVC_ENABLED")]
    pvc_enabled: bool,

    #[arg(long, default_value = "1Gi", env = "STUDENT_PVC_SIZE")]
    pvc_size: String,

    #[arg(long, env = "STUDENT_PVC_STORAGE_CLASS")]
    pvc_storage_class: Option<String>,

    #[arg(long, default_value = "/data", env = "STUDENT_PVC_MOUNT_PATH")]
    pvc_mount_path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init(&args.log_filter, args.log_format);

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&args.database_url)
        .await?;
    MIGRATOR.run(&db).await?;

    let cluster_config = if args.k8s_in_cluster {
        ClusterConfig::InCluster
    } else {
        args.kubeconfig
            .clone()
            .map(ClusterConfig::Kubeconfig)
            .unwrap_or_default()
    };
    let client = new_client(&cluster_config).await?;

    let volume = VolumeOptions {
        enabled: args.pvc_enabled,
        size: args.pvc_size.clone(),
        storage_class: args.pvc_storage_class.clone(),
        mount_path: args.pvc_mount_path.clone(),
    };
    let ctx = Context::new(client, db, volume, args.tls_secret_name.clone());

    let logs = match &args.object_store_endpoint {
        Some(endpoint) => {
            let store = BuildLogStore::new(
                endpoint,
                &args.object_store_access_key,
                &args.object_store_secret_key,
                &args.object_store_bucket,
            );
            match store.ensure_bucket().await {
                Ok(()) => Some(Arc::new(store)),
                Err(e) => {
                    warn!(msg = "object store unavailable, log archiving disabled", %e);
                    None
                }
            }
        }
        None => None,
    };

    let git = GitHosts {
        external_host: args
            .git_url
            .as_deref()
            .and_then(|raw| url::Url::parse(raw).ok())
            .and_then(|parsed| parsed.host_str().map(str::to_string)),
        internal_host: args.git_ssh_internal_host.clone(),
        internal_port: args.git_ssh_internal_port,
    };
    let build_ctx = BuildContext {
        core: ctx.clone(),
        logs,
        git,
        webhook_secret: args.webhook_secret.clone(),
    };

    if let Some(tls_secret_name) = &args.tls_secret_name {
        sync_student_ingress_tls(
            &ctx.client,
            tls_secret_name,
            ProjectClass::student_namespaces(),
        )
        .await;
    }

    let app = http::router(ctx, build_ctx);
    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!(msg = "portald listening", port = args.port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}
