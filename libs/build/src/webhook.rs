//! Push-event intake: verify the signature, map the repository to a build
//! configuration and hand the commit to the orchestrator.

use crate::context::BuildContext;
use crate::git::normalize_repo_url;
use crate::orchestrator;

use portal_operator::error::{Error, Result};
use portal_store::model::BuildConfig;
use portal_store::repo;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_HEADER: &str = "x-webhook-event";
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Default, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
    #[serde(default)]
    pub repository: Option<PushRepository>,
}

#[derive(Debug, Deserialize)]
pub struct PushCommit {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PushRepository {
    #[serde(default)]
    pub ssh_url: Option<String>,
    #[serde(default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl PushRepository {
    /// SSH URL first: it is the one build configs are registered with.
    fn preferred_url(&self) -> Option<&str> {
        [&self.ssh_url, &self.clone_url, &self.html_url, &self.url]
            .into_iter()
            .find_map(|url| url.as_deref().filter(|s| !s.is_empty()))
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PushOutcome {
    Triggered { build_id: i64 },
    Ignored { reason: String },
}

enum PushDecision {
    Trigger {
        student_id: i64,
        commit_sha: String,
        branch: String,
    },
    Ignore(String),
}

/// Entry point for the webhook endpoint: raw body plus the event and
/// signature headers.
pub async fn on_push(
    ctx: &BuildContext,
    event_type: Option<&str>,
    signature: Option<&str>,
    raw_body: &[u8],
) -> Result<PushOutcome> {
    ctx.core.metrics.webhook_event_inc();

    if let Some(secret) = ctx.webhook_secret.as_deref().filter(|s| !s.is_empty()) {
        verify_signature(secret, signature, raw_body)?;
    }
    if event_type != Some("push") {
        return Ok(PushOutcome::Ignored {
            reason: "ignored event type".to_string(),
        });
    }

    let payload: PushEvent = serde_json::from_slice(raw_body)
        .map_err(|e| Error::InvalidInput(format!("invalid JSON payload: {e}")))?;
    let configs = repo::all_build_configs(&ctx.core.db)
        .await
        .map_err(|e| Error::db("failed to scan build configs", e))?;

    match evaluate_push(&configs, &payload)? {
        PushDecision::Ignore(reason) => {
            info!(msg = "push ignored", reason);
            Ok(PushOutcome::Ignored { reason })
        }
        PushDecision::Trigger {
            student_id,
            commit_sha,
            branch,
        } => {
            let build = orchestrator::trigger(ctx, student_id, &commit_sha, Some(&branch)).await?;
            Ok(PushOutcome::Triggered { build_id: build.id })
        }
    }
}

/// Constant-time verification of `sha256={hex}` over the raw body.
pub fn verify_signature(secret: &str, signature: Option<&str>, raw_body: &[u8]) -> Result<()> {
    let Some(header) = signature else {
        return Err(Error::Forbidden("missing webhook signature".to_string()));
    };
    let hex_signature = header.strip_prefix("sha256=").unwrap_or(header);
    let provided = decode_hex(hex_signature)
        .ok_or_else(|| Error::Forbidden("malformed webhook signature".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| Error::Forbidden("invalid webhook secret".to_string()))?;
    mac.update(raw_body);
    mac.verify_slice(&provided)
        .map_err(|_| Error::Forbidden("invalid webhook signature".to_string()))
}

fn evaluate_push(configs: &[BuildConfig], payload: &PushEvent) -> Result<PushDecision> {
    let repo_url = payload
        .repository
        .as_ref()
        .and_then(PushRepository::preferred_url);
    let Some(normalized) = repo_url.and_then(normalize_repo_url) else {
        return Err(Error::InvalidInput("missing repository URL".to_string()));
    };

    let Some(config) = configs
        .iter()
        .find(|c| normalize_repo_url(&c.repo_url).as_deref() == Some(normalized.as_str()))
    else {
        return Ok(PushDecision::Ignore(format!(
            "no build config for {normalized}"
        )));
    };
    if !config.auto_build {
        return Ok(PushDecision::Ignore("auto build disabled".to_string()));
    }

    let branch = payload
        .git_ref
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("main")
        .to_string();
    if branch != config.branch {
        return Ok(PushDecision::Ignore(format!(
            "push to {branch} ignored, builds track {}",
            config.branch
        )));
    }

    let commit_sha = payload
        .commits
        .last()
        .and_then(|commit| commit.id.clone())
        .or_else(|| payload.after.clone())
        .filter(|sha| !sha.is_empty())
        .unwrap_or_else(|| "latest".to_string());

    Ok(PushDecision::Trigger {
        student_id: config.student_id,
        commit_sha,
        branch,
    })
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}
