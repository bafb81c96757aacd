//! Typed persistence adapters. Every function takes the pool handle
//! explicitly; nothing here keeps ambient session state.

use crate::model::{
    Build, BuildConfig, BuildStatus, DEFAULT_BUILD_NAMESPACE, DEFAULT_IMAGE_REPO_TEMPLATE,
    DEFAULT_STUDENT_DOMAIN_BASE, DEFAULT_STUDENT_DOMAIN_PREFIX, DeploymentRecord, Registry,
    Student, SystemSetting,
};

use chrono::{DateTime, Utc};
use sqlx::PgPool;

const STUDENT_COLS: &str =
    "id, student_code, name, project_class, teacher_id, git_repo_url, expected_image, domain, created_at";
const BUILD_COLS: &str = "id, student_id, commit_sha, branch, image_tag, status, message, job_name, \
     log_object_key, started_at, finished_at, duration, created_at";
const BUILD_CONFIG_COLS: &str = "student_id, repo_url, branch, dockerfile_path, context_path, registry_id, image_repo, \
     tag_strategy, auto_build, auto_deploy, deploy_key_public, deploy_key_private, \
     deploy_key_fingerprint, deploy_key_created_at, created_at, updated_at";
const DEPLOYMENT_COLS: &str =
    "id, student_id, build_id, image, status, message, last_deploy_time, created_at";
const REGISTRY_COLS: &str = "id, name, url, username, password, is_active, created_at";
const SETTING_COLS: &str = "id, student_domain_prefix, student_domain_base, build_namespace, \
     default_registry_id, default_image_repo_template";

pub async fn student_by_id(pool: &PgPool, id: i64) -> Result<Option<Student>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {STUDENT_COLS} FROM students WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn student_by_code(pool: &PgPool, code: &str) -> Result<Option<Student>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {STUDENT_COLS} FROM students WHERE student_code = $1"
    ))
    .bind(code)
    .fetch_optional(pool)
    .await
}

pub async fn update_student_domain(
    pool: &PgPool,
    id: i64,
    domain: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE students SET domain = $2 WHERE id = $1")
        .bind(id)
        .bind(domain)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn build_config_for_student(
    pool: &PgPool,
    student_id: i64,
) -> Result<Option<BuildConfig>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {BUILD_CONFIG_COLS} FROM build_configs WHERE student_id = $1"
    ))
    .bind(student_id)
    .fetch_optional(pool)
    .await
}

/// Full scan used by the webhook intake to match an incoming repository URL.
pub async fn all_build_configs(pool: &PgPool) -> Result<Vec<BuildConfig>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {BUILD_CONFIG_COLS} FROM build_configs"))
        .fetch_all(pool)
        .await
}

pub async fn save_deploy_key(
    pool: &PgPool,
    student_id: i64,
    public_key: &str,
    private_key: &str,
    fingerprint: &str,
    created_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE build_configs SET deploy_key_public = $2, deploy_key_private = $3, \
         deploy_key_fingerprint = $4, deploy_key_created_at = $5, updated_at = now() \
         WHERE student_id = $1",
    )
    .bind(student_id)
    .bind(public_key)
    .bind(private_key)
    .bind(fingerprint)
    .bind(created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn registry_by_id(pool: &PgPool, id: i64) -> Result<Option<Registry>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {REGISTRY_COLS} FROM registries WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn insert_build(
    pool: &PgPool,
    student_id: i64,
    commit_sha: &str,
    branch: &str,
    image_tag: &str,
    message: &str,
) -> Result<Build, sqlx::Error> {
    sqlx::query_as(&format!(
        "INSERT INTO builds (student_id, commit_sha, branch, image_tag, status, message) \
         VALUES ($1, $2, $3, $4, 'pending', $5) RETURNING {BUILD_COLS}"
    ))
    .bind(student_id)
    .bind(commit_sha)
    .bind(branch)
    .bind(image_tag)
    .bind(message)
    .fetch_one(pool)
    .await
}

pub async fn build_by_id(pool: &PgPool, id: i64) -> Result<Option<Build>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {BUILD_COLS} FROM builds WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn builds_for_student(
    pool: &PgPool,
    student_id: i64,
) -> Result<Vec<Build>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {BUILD_COLS} FROM builds WHERE student_id = $1 ORDER BY id DESC"
    ))
    .bind(student_id)
    .fetch_all(pool)
    .await
}

pub async fn mark_build_running(
    pool: &PgPool,
    id: i64,
    job_name: &str,
    started_at: DateTime<Utc>,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE builds SET status = 'running', job_name = $2, started_at = $3, message = $4 \
         WHERE id = $1",
    )
    .bind(id)
    .bind(job_name)
    .bind(started_at)
    .bind(message)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_build_failed(pool: &PgPool, id: i64, message: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE builds SET status = 'failed', message = $2 WHERE id = $1")
        .bind(id)
        .bind(message)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_build_terminal(
    pool: &PgPool,
    id: i64,
    status: BuildStatus,
    message: &str,
    finished_at: DateTime<Utc>,
    duration: Option<i64>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE builds SET status = $2, message = $3, finished_at = $4, duration = $5 \
         WHERE id = $1",
    )
    .bind(id)
    .bind(status)
    .bind(message)
    .bind(finished_at)
    .bind(duration)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_build_status_message(
    pool: &PgPool,
    id: i64,
    status: BuildStatus,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE builds SET status = $2, message = $3 WHERE id = $1")
        .bind(id)
        .bind(status)
        .bind(message)
        .execute(pool)
        .await?;
    Ok(())
}

/// One-time backfill; the orchestrator guards on the key being unset.
pub async fn set_build_log_key(pool: &PgPool, id: i64, key: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE builds SET log_object_key = $2 WHERE id = $1 AND log_object_key IS NULL")
        .bind(id)
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn deployment_for_build(
    pool: &PgPool,
    build_id: i64,
) -> Result<Option<DeploymentRecord>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {DEPLOYMENT_COLS} FROM deployments WHERE build_id = $1 LIMIT 1"
    ))
    .bind(build_id)
    .fetch_optional(pool)
    .await
}

pub async fn insert_deployment(
    pool: &PgPool,
    student_id: i64,
    image: &str,
    build_id: Option<i64>,
    message: &str,
) -> Result<DeploymentRecord, sqlx::Error> {
    sqlx::query_as(&format!(
        "INSERT INTO deployments (student_id, build_id, image, status, message, last_deploy_time) \
         VALUES ($1, $2, $3, 'deploying', $4, now()) RETURNING {DEPLOYMENT_COLS}"
    ))
    .bind(student_id)
    .bind(build_id)
    .bind(image)
    .bind(message)
    .fetch_one(pool)
    .await
}

pub async fn mark_deployment_running(
    pool: &PgPool,
    id: i64,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE deployments SET status = 'running', message = $2, last_deploy_time = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(message)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_deployment_failed(
    pool: &PgPool,
    id: i64,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE deployments SET status = 'failed', message = $2, last_deploy_time = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(message)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch the singleton settings row, creating it on first use and
/// backfilling any column an older row left NULL.
pub async fn get_or_create_settings(pool: &PgPool) -> Result<SystemSetting, sqlx::Error> {
    let existing: Option<SystemSetting> = sqlx::query_as(&format!(
        "SELECT {SETTING_COLS} FROM system_settings ORDER BY id LIMIT 1"
    ))
    .fetch_optional(pool)
    .await?;

    match existing {
        Some(setting)
            if setting.student_domain_prefix.is_some()
                && setting.student_domain_base.is_some()
                && setting.build_namespace.is_some()
                && setting.default_image_repo_template.is_some() =>
        {
            Ok(setting)
        }
        Some(setting) => {
            sqlx::query_as(&format!(
                "UPDATE system_settings SET \
                 student_domain_prefix = COALESCE(student_domain_prefix, $2), \
                 student_domain_base = COALESCE(student_domain_base, $3), \
                 build_namespace = COALESCE(build_namespace, $4), \
                 default_image_repo_template = COALESCE(default_image_repo_template, $5) \
                 WHERE id = $1 RETURNING {SETTING_COLS}"
            ))
            .bind(setting.id)
            .bind(DEFAULT_STUDENT_DOMAIN_PREFIX)
            .bind(DEFAULT_STUDENT_DOMAIN_BASE)
            .bind(DEFAULT_BUILD_NAMESPACE)
            .bind(DEFAULT_IMAGE_REPO_TEMPLATE)
            .fetch_one(pool)
            .await
        }
        None => {
            sqlx::query_as(&format!(
                "INSERT INTO system_settings \
                 (student_domain_prefix, student_domain_base, build_namespace, default_image_repo_template) \
                 VALUES ($1, $2, $3, $4) RETURNING {SETTING_COLS}"
            ))
            .bind(DEFAULT_STUDENT_DOMAIN_PREFIX)
            .bind(DEFAULT_STUDENT_DOMAIN_BASE)
            .bind(DEFAULT_BUILD_NAMESPACE)
            .bind(DEFAULT_IMAGE_REPO_TEMPLATE)
            .fetch_one(pool)
            .await
        }
    }
}
