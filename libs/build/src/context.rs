use crate::logs::BuildLogStore;

use portal_operator::context::Context;

use std::sync::Arc;

/// Git host facts needed to relocate clone URLs for in-cluster jobs: repo
/// URLs carry the public hostname, but the Kaniko pod has to reach the git
/// service through its cluster-internal SSH endpoint.
#[derive(Clone, Debug, Default)]
pub struct GitHosts {
    pub external_host: Option<String>,
    pub internal_host: Option<String>,
    pub internal_port: Option<u16>,
}

/// Orchestrator handles on top of the core [`Context`].
#[derive(Clone)]
pub struct BuildContext {
    pub core: Context,
    /// Log archive; builds still run when the object store is disabled.
    pub logs: Option<Arc<BuildLogStore>>,
    pub git: GitHosts,
    /// Shared webhook secret; unsigned pushes are accepted when unset.
    pub webhook_secret: Option<String>,
}
