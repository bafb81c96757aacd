//! Build lifecycle: trigger submits a Kaniko job after materializing the
//! secrets it needs; sync lazily reconciles the recorded build with the live
//! Job whenever a non-terminal build is read.

use crate::context::BuildContext;
use crate::git;
use crate::logs::log_object_key;

use portal_k8s_util::retry::with_backoff;
use portal_operator::actor::Actor;
use portal_operator::deploy;
use portal_operator::error::{Error, Result};
use portal_operator::settings::{normalize_registry_host, render_image_repo};
use portal_resources::kaniko::{self, GIT_CLONE_CONTAINER, KANIKO_CONTAINER, KanikoBuildJob};
use portal_store::model::{
    Build, BuildConfig, BuildStatus, Registry, Student, SystemSetting, TagStrategy,
};
use portal_store::repo;

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, ListParams, LogParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const FIELD_MANAGER: &str = "portal-controller";

#[inline]
pub fn deploy_key_secret_name(student_id: i64) -> String {
    format!("student-deploy-key-{student_id}")
}

#[inline]
pub fn registry_secret_name(registry_id: i64) -> String {
    format!("kaniko-registry-auth-{registry_id}")
}

/// Kick off a build for the student: resolve registry, image repository and
/// tag, record the pending row, then submit the Kaniko job. Failures after
/// the row exists land on the row instead of the caller.
#[instrument(skip(ctx))]
pub async fn trigger(
    ctx: &BuildContext,
    student_id: i64,
    commit_sha: &str,
    branch: Option<&str>,
) -> Result<Build> {
    let config = repo::build_config_for_student(&ctx.core.db, student_id)
        .await
        .map_err(|e| Error::db("failed to load build config", e))?
        .ok_or_else(|| Error::NotFound(format!("build config for student {student_id}")))?;
    if config.repo_url.trim().is_empty() {
        return Err(Error::InvalidInput(
            "repo_url is required for builds".to_string(),
        ));
    }
    let student = repo::student_by_id(&ctx.core.db, student_id)
        .await
        .map_err(|e| Error::db("failed to load student", e))?
        .ok_or_else(|| Error::NotFound(format!("student {student_id}")))?;

    let branch = branch.filter(|b| !b.is_empty()).unwrap_or(&config.branch);
    let setting = repo::get_or_create_settings(&ctx.core.db)
        .await
        .map_err(|e| Error::db("failed to load system settings", e))?;
    let registry = resolve_registry(ctx, &config, &setting).await?;
    let image_repo = resolve_image_repo(&config, &setting, registry.as_ref(), &student)?;
    let image_tag = resolve_image_tag(config.tag_strategy, commit_sha, branch);
    let final_image = format!("{image_repo}:{image_tag}");

    let build = repo::insert_build(
        &ctx.core.db,
        student_id,
        commit_sha,
        branch,
        &image_tag,
        "Initializing...",
    )
    .await
    .map_err(|e| Error::db("failed to insert build", e))?;

    match submit_build_job(ctx, &build, &config, &setting, registry.as_ref(), &final_image).await {
        Ok(job_name) => {
            info!(msg = "build job submitted", build_id = build.id, job_name);
            repo::mark_build_running(&ctx.core.db, build.id, &job_name, Utc::now(), "Job submitted")
                .await
                .map_err(|e| Error::db("failed to mark build running", e))?;
            ctx.core.metrics.build_triggered_inc();
        }
        Err(e) => {
            error!(msg = "failed to create build job", build_id = build.id, %e);
            repo::mark_build_failed(&ctx.core.db, build.id, &e.to_string())
                .await
                .map_err(|db_err| Error::db("failed to mark build failed", db_err))?;
        }
    }

    refreshed(ctx, build.id).await
}

/// Lazy reconciliation, called whenever a non-terminal build is read.
/// Terminal statuses are sticky; the only later write is the one-time log
/// key backfill.
pub async fn sync(ctx: &BuildContext, build: Build) -> Result<Build> {
    if build.status.is_terminal() {
        return Ok(build);
    }
    let Some(job_name) = build.job_name.clone() else {
        return Ok(build);
    };

    let setting = repo::get_or_create_settings(&ctx.core.db)
        .await
        .map_err(|e| Error::db("failed to load system settings", e))?;
    let namespace = setting.build_namespace().to_string();

    let jobs: Api<Job> = Api::namespaced(ctx.core.client.clone(), &namespace);
    let job = jobs.get_opt(&job_name).await.map_err(|e| {
        Error::cluster(format!("failed to read Job {namespace}/{job_name}"), e)
    })?;
    let Some(job) = job else {
        repo::mark_build_status_message(&ctx.core.db, build.id, BuildStatus::Error, "Build job not found")
            .await
            .map_err(|e| Error::db("failed to mark build error", e))?;
        return refreshed(ctx, build.id).await;
    };

    let job_status = job.status.unwrap_or_default();
    let terminal = if job_status.succeeded.unwrap_or(0) > 0 {
        Some((BuildStatus::Success, "Build succeeded"))
    } else if job_status.failed.unwrap_or(0) > 0 {
        Some((BuildStatus::Failed, "Build failed"))
    } else {
        if job_status.active.unwrap_or(0) > 0 && build.status != BuildStatus::Running {
            repo::mark_build_status_message(
                &ctx.core.db,
                build.id,
                BuildStatus::Running,
                "Build running",
            )
            .await
            .map_err(|e| Error::db("failed to mark build running", e))?;
            return refreshed(ctx, build.id).await;
        }
        None
    };

    let Some((status, message)) = terminal else {
        return Ok(build);
    };

    let finished_at = Utc::now();
    let duration = duration_seconds(build.started_at, finished_at);
    repo::mark_build_terminal(&ctx.core.db, build.id, status, message, finished_at, duration)
        .await
        .map_err(|e| Error::db("failed to finalize build", e))?;

    let mut updated = refreshed(ctx, build.id).await?;
    archive_logs(ctx, &mut updated, &namespace).await;
    if updated.status == BuildStatus::Success {
        auto_deploy(ctx, &updated).await;
    }
    Ok(updated)
}

async fn refreshed(ctx: &BuildContext, build_id: i64) -> Result<Build> {
    repo::build_by_id(&ctx.core.db, build_id)
        .await
        .map_err(|e| Error::db("failed to reload build", e))?
        .ok_or_else(|| Error::NotFound(format!("build {build_id}")))
}

async fn resolve_registry(
    ctx: &BuildContext,
    config: &BuildConfig,
    setting: &SystemSetting,
) -> Result<Option<Registry>> {
    let Some(registry_id) = config.registry_id.or(setting.default_registry_id) else {
        return Ok(None);
    };
    repo::registry_by_id(&ctx.core.db, registry_id)
        .await
        .map_err(|e| Error::db("failed to load registry", e))
}

fn resolve_image_repo(
    config: &BuildConfig,
    setting: &SystemSetting,
    registry: Option<&Registry>,
    student: &Student,
) -> Result<String> {
    if let Some(image_repo) = config.image_repo.as_deref().filter(|s| !s.is_empty()) {
        return Ok(image_repo.to_string());
    }
    render_image_repo(setting.image_repo_template(), registry, &student.student_code)
        .ok_or_else(|| Error::InvalidInput("image repository is not configured".to_string()))
}

/// Deterministic for a given (strategy, commit, branch); the manual fallback
/// is the one place randomness enters.
pub fn resolve_image_tag(strategy: TagStrategy, commit_sha: &str, branch: &str) -> String {
    if strategy == TagStrategy::BranchLatest && !branch.is_empty() {
        return format!("{branch}-latest");
    }
    if !commit_sha.is_empty() && commit_sha != "latest" {
        return commit_sha.chars().take(7).collect();
    }
    format!("manual-{}", random_suffix())
}

fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_string()
}

fn duration_seconds(started_at: Option<DateTime<Utc>>, finished_at: DateTime<Utc>) -> Option<i64> {
    started_at.map(|started| (finished_at - started).num_seconds())
}

async fn submit_build_job(
    ctx: &BuildContext,
    build: &Build,
    config: &BuildConfig,
    setting: &SystemSetting,
    registry: Option<&Registry>,
    final_image: &str,
) -> Result<String> {
    let namespace = setting.build_namespace();
    let job_name = format!("build-{}-{}", build.id, random_suffix());

    let use_ssh = git::is_ssh_url(&config.repo_url);
    let clone_url = if use_ssh {
        git::rewrite_internal_host(
            &config.repo_url,
            ctx.git.internal_host.as_deref(),
            ctx.git.internal_port,
            ctx.git.external_host.as_deref(),
        )
    } else {
        config.repo_url.clone()
    };
    let (_, git_port) = git::extract_host_and_port(&clone_url);

    let git_secret_name = if use_ssh {
        let private_key = config
            .deploy_key_private
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                Error::InvalidInput("deploy key is required for SSH clones".to_string())
            })?;
        let secret_name = deploy_key_secret_name(build.student_id);
        ensure_secret(
            &ctx.core.client,
            namespace,
            git_secret(namespace, &secret_name, private_key),
        )
        .await?;
        Some(secret_name)
    } else {
        None
    };

    let registry_secret_name = match registry {
        Some(registry) => {
            let secret_name = registry_secret_name(registry.id);
            ensure_secret(
                &ctx.core.client,
                namespace,
                registry_secret(namespace, &secret_name, registry)?,
            )
            .await?;
            Some(secret_name)
        }
        None => None,
    };

    let clone_script =
        kaniko::clone_script(&clone_url, Some(&build.commit_sha), &build.branch, git_port);
    let kaniko_job = KanikoBuildJob {
        job_name: job_name.clone(),
        namespace: namespace.to_string(),
        destinations: vec![final_image.to_string()],
        context_path: config.context_path.clone(),
        dockerfile_path: config.dockerfile_path.clone(),
        git_secret_name,
        registry_secret_name,
        clone_script,
        extra_labels: BTreeMap::from([
            ("build-id".to_string(), build.id.to_string()),
            ("student-id".to_string(), build.student_id.to_string()),
        ]),
    };

    let jobs: Api<Job> = Api::namespaced(ctx.core.client.clone(), namespace);
    let job = kaniko_job.job();
    with_backoff(|| async { jobs.create(&PostParams::default(), &job).await })
        .await
        .map_err(|e| {
            Error::cluster(format!("failed to create build Job {namespace}/{job_name}"), e)
        })?;
    Ok(job_name)
}

fn git_secret(namespace: &str, name: &str, private_key: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(
            "id_rsa".to_string(),
            private_key.to_string(),
        )])),
        ..Secret::default()
    }
}

fn registry_secret(namespace: &str, name: &str, registry: &Registry) -> Result<Secret> {
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        string_data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            dockerconfig_json(registry)?,
        )])),
        ..Secret::default()
    })
}

pub fn dockerconfig_json(registry: &Registry) -> Result<String> {
    let username = registry
        .username
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidInput("registry credentials are incomplete".to_string()))?;
    let password = registry
        .password
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidInput("registry credentials are incomplete".to_string()))?;
    let host = normalize_registry_host(&registry.url);
    let auth = STANDARD.encode(format!("{username}:{password}"));
    let config = json!({
        "auths": {
            host: {
                "username": username,
                "password": password,
                "auth": auth,
            }
        }
    });
    serde_json::to_string(&config)
        .map_err(|e| Error::SerializationError("failed to encode dockerconfig".to_string(), e))
}

/// Server-side apply: create-or-replace in one call, no read-modify-write
/// window between concurrent builds of the same student.
async fn ensure_secret(client: &Client, namespace: &str, secret: Secret) -> Result<()> {
    let name = secret.name_any();
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    with_backoff(|| async {
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await
    })
    .await
    .map_err(|e| Error::cluster(format!("failed to apply Secret {namespace}/{name}"), e))?;
    Ok(())
}

/// Best-effort, exactly-once: guarded by `log_object_key`, and a failure
/// never rolls back the terminal status.
async fn archive_logs(ctx: &BuildContext, build: &mut Build, namespace: &str) {
    if build.log_object_key.is_some() {
        return;
    }
    let Some(job_name) = build.job_name.as_deref() else {
        return;
    };
    let Some(logs) = ctx.logs.as_ref() else {
        return;
    };
    let Some(content) = collect_job_logs(&ctx.core.client, namespace, job_name).await else {
        return;
    };
    let key = log_object_key(build.id, job_name);
    match logs.upload_log(&key, &content).await {
        Ok(()) => match repo::set_build_log_key(&ctx.core.db, build.id, &key).await {
            Ok(()) => build.log_object_key = Some(key),
            Err(e) => warn!(msg = "failed to record log key", build_id = build.id, %e),
        },
        Err(e) => warn!(msg = "failed to archive build logs", build_id = build.id, %e),
    }
}

async fn collect_job_logs(client: &Client, namespace: &str, job_name: &str) -> Option<String> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod_list = pods
        .list(&ListParams::default().labels(&format!("job-name={job_name}")))
        .await
        .map_err(|e| warn!(msg = "failed to list pods for job", job_name, %e))
        .ok()?;
    let pod = pod_list.items.first()?;
    let pod_name = pod.name_any();

    let mut sections = Vec::new();
    for container in [GIT_CLONE_CONTAINER, KANIKO_CONTAINER] {
        let params = LogParams {
            container: Some(container.to_string()),
            timestamps: true,
            ..LogParams::default()
        };
        match pods.logs(&pod_name, &params).await {
            Ok(text) if !text.is_empty() => {
                sections.push(format!("--- {container} ---"));
                sections.push(text);
            }
            Ok(_) => {}
            Err(e) => warn!(msg = "failed to read container log", container, %e),
        }
    }
    let joined = sections.join("\n").trim().to_string();
    (!joined.is_empty()).then_some(joined)
}

/// Triggered on the success transition when the config opts in and no
/// deployment record references the build yet. Failure is logged and
/// swallowed; the build stays `success`.
async fn auto_deploy(ctx: &BuildContext, build: &Build) {
    if let Err(e) = try_auto_deploy(ctx, build).await {
        warn!(msg = "auto deploy failed", build_id = build.id, %e);
    }
}

async fn try_auto_deploy(ctx: &BuildContext, build: &Build) -> Result<()> {
    let Some(config) = repo::build_config_for_student(&ctx.core.db, build.student_id)
        .await
        .map_err(|e| Error::db("failed to load build config", e))?
    else {
        return Ok(());
    };
    if !config.auto_deploy {
        return Ok(());
    }
    if repo::deployment_for_build(&ctx.core.db, build.id)
        .await
        .map_err(|e| Error::db("failed to check deployments", e))?
        .is_some()
    {
        return Ok(());
    }
    let Some(student) = repo::student_by_id(&ctx.core.db, build.student_id)
        .await
        .map_err(|e| Error::db("failed to load student", e))?
    else {
        return Ok(());
    };
    let Some(image_tag) = build.image_tag.as_deref() else {
        return Ok(());
    };

    let setting = repo::get_or_create_settings(&ctx.core.db)
        .await
        .map_err(|e| Error::db("failed to load system settings", e))?;
    let registry = resolve_registry(ctx, &config, &setting).await?;
    let image_repo = resolve_image_repo(&config, &setting, registry.as_ref(), &student)?;
    let image = format!("{image_repo}:{image_tag}");

    info!(msg = "auto deploying build", build_id = build.id, image);
    deploy::deploy(
        &ctx.core,
        &Actor::Admin,
        &student,
        &image,
        student.project_class,
        Some(build.id),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    fn registry(url: &str) -> Registry {
        Registry {
            id: 9,
            name: "main".to_string(),
            url: url.to_string(),
            username: Some("robot".to_string()),
            password: Some("hunter2".to_string()),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_resolve_image_tag_branch_latest() {
        assert_eq!(
            resolve_image_tag(TagStrategy::BranchLatest, "deadbeefcafef00d", "main"),
            "main-latest"
        );
    }

    #[test]
    fn test_resolve_image_tag_short_sha() {
        assert_eq!(
            resolve_image_tag(TagStrategy::ShortSha, "deadbeefcafef00d", "main"),
            "deadbee"
        );
    }

    #[test]
    fn test_resolve_image_tag_manual_fallback() {
        let tag = resolve_image_tag(TagStrategy::ShortSha, "latest", "");
        assert!(tag.starts_with("manual-"));
        assert_eq!(tag.len(), "manual-".len() + 6);
    }

    #[test]
    fn test_secret_names() {
        assert_eq!(deploy_key_secret_name(3), "student-deploy-key-3");
        assert_eq!(registry_secret_name(9), "kaniko-registry-auth-9");
    }

    #[test]
    fn test_dockerconfig_json_shape() {
        let config = dockerconfig_json(&registry("https://reg.example/")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&config).unwrap();
        let entry = &value["auths"]["reg.example"];
        assert_eq!(entry["username"], "robot");
        assert_eq!(entry["password"], "hunter2");
        assert_eq!(
            entry["auth"],
            STANDARD.encode("robot:hunter2").as_str()
        );
    }

    #[test]
    fn test_dockerconfig_json_requires_credentials() {
        let mut reg = registry("reg.example");
        reg.password = None;
        assert!(matches!(
            dockerconfig_json(&reg),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_git_secret_shape() {
        let secret = git_secret("hydrosim", "student-deploy-key-3", "PRIVATE");
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert_eq!(
            secret.string_data.unwrap().get("id_rsa").unwrap(),
            "PRIVATE"
        );
    }

    #[test]
    fn test_duration_seconds() {
        let started = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        let finished = Utc.with_ymd_and_hms(2026, 1, 5, 10, 2, 30).unwrap();
        assert_eq!(duration_seconds(Some(started), finished), Some(150));
        assert_eq!(duration_seconds(None, finished), None);
    }
}
