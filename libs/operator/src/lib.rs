pub mod actor;
pub mod context;
pub mod deploy;
pub mod error;
pub mod ingress_sync;
pub mod metrics;
pub mod settings;
pub mod status;
pub mod telemetry;
