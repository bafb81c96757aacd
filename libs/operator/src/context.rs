use crate::metrics::Metrics;

use portal_resources::student::VolumeOptions;

use std::sync::Arc;

use kube::Client;
use sqlx::PgPool;

/// Shared handles threaded through every core operation. Built once at
/// startup from explicit configuration; no module-global clients.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client.
    pub client: Client,
    /// Relational store pool.
    pub db: PgPool,
    /// Persistent storage knobs for student workloads.
    pub volume: VolumeOptions,
    /// TLS secret shared by all student ingresses, if any.
    pub tls_secret_name: Option<String>,
    /// Prometheus metrics.
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(
        client: Client,
        db: PgPool,
        volume: VolumeOptions,
        tls_secret_name: Option<String>,
    ) -> Self {
        Self {
            client,
            db,
            volume,
            tls_secret_name,
            metrics: Arc::new(Metrics::new()),
        }
    }
}
