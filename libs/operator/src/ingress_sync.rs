use portal_resources::student::{
    ANNOTATION_ENTRYPOINTS, ANNOTATION_INGRESS_CLASS, ANNOTATION_ROUTER_TLS, ENTRYPOINTS_TLS,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, TRAEFIK_INGRESS_CLASS,
};

use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TlsSyncOutcome {
    pub patched: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Startup reconciliation: bring every student-managed ingress onto the
/// shared TLS secret and the websecure entrypoint. Ingresses that already
/// match are left alone; namespaces the service account cannot list are
/// counted and skipped.
pub async fn sync_student_ingress_tls(
    client: &Client,
    tls_secret_name: &str,
    namespaces: impl IntoIterator<Item = &str>,
) -> TlsSyncOutcome {
    let mut outcome = TlsSyncOutcome::default();

    for namespace in namespaces {
        let api: Api<Ingress> = Api::namespaced(client.clone(), namespace);
        let ingresses = match api.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                warn!(msg = "failed to list ingresses", namespace, %e);
                outcome.errors += 1;
                continue;
            }
        };

        for ingress in ingresses {
            if !is_student_ingress(&ingress) {
                continue;
            }
            let hosts = collect_hosts(&ingress);
            if hosts.is_empty() {
                outcome.skipped += 1;
                continue;
            }
            if !needs_tls_patch(&ingress, tls_secret_name, &hosts) {
                outcome.skipped += 1;
                continue;
            }

            let mut annotations = ingress.annotations().clone();
            annotations.insert(
                ANNOTATION_INGRESS_CLASS.to_string(),
                TRAEFIK_INGRESS_CLASS.to_string(),
            );
            annotations.insert(ANNOTATION_ENTRYPOINTS.to_string(), ENTRYPOINTS_TLS.to_string());
            annotations.insert(ANNOTATION_ROUTER_TLS.to_string(), "true".to_string());
            let patch = json!({
                "metadata": {"annotations": annotations},
                "spec": {
                    "tls": [{"hosts": hosts, "secretName": tls_secret_name}],
                    "ingressClassName": TRAEFIK_INGRESS_CLASS,
                },
            });

            let name = ingress.name_any();
            match api
                .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => outcome.patched += 1,
                Err(e) => {
                    warn!(msg = "failed to patch ingress", namespace, name, %e);
                    outcome.errors += 1;
                }
            }
        }
    }

    if outcome.patched > 0 || outcome.errors > 0 {
        info!(
            msg = "student ingress TLS sync finished",
            patched = outcome.patched,
            skipped = outcome.skipped,
            errors = outcome.errors
        );
    }
    outcome
}

fn is_student_ingress(ingress: &Ingress) -> bool {
    let labels = ingress.labels();
    if labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE) {
        return true;
    }
    if labels.contains_key("student") {
        return true;
    }
    ingress.name_any().starts_with("student-")
}

fn collect_hosts(ingress: &Ingress) -> Vec<String> {
    let mut hosts = Vec::new();
    let rules = ingress.spec.as_ref().and_then(|s| s.rules.as_ref());
    for rule in rules.into_iter().flatten() {
        if let Some(host) = &rule.host {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
    }
    hosts
}

fn needs_tls_patch(ingress: &Ingress, secret_name: &str, hosts: &[String]) -> bool {
    let annotations = ingress.annotations();
    if annotations.get(ANNOTATION_ENTRYPOINTS).map(String::as_str) != Some(ENTRYPOINTS_TLS) {
        return true;
    }
    if annotations.get(ANNOTATION_ROUTER_TLS).map(String::as_str) != Some("true") {
        return true;
    }
    if annotations.get(ANNOTATION_INGRESS_CLASS).map(String::as_str)
        != Some(TRAEFIK_INGRESS_CLASS)
    {
        return true;
    }
    let spec = ingress.spec.as_ref();
    if spec.and_then(|s| s.ingress_class_name.as_deref()) != Some(TRAEFIK_INGRESS_CLASS) {
        return true;
    }

    let existing_tls = spec.and_then(|s| s.tls.as_ref());
    let mut existing_hosts = Vec::new();
    let mut has_secret = false;
    for tls in existing_tls.into_iter().flatten() {
        if tls.secret_name.as_deref() == Some(secret_name) {
            has_secret = true;
        }
        existing_hosts.extend(tls.hosts.clone().unwrap_or_default());
    }
    if !has_secret {
        return true;
    }
    hosts.iter().any(|host| !existing_hosts.contains(host))
}
