use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_STUDENT_DOMAIN_PREFIX: &str = "stu-";
pub const DEFAULT_STUDENT_DOMAIN_BASE: &str = "hydrosim.cn";
pub const DEFAULT_BUILD_NAMESPACE: &str = "hydrosim";
pub const DEFAULT_IMAGE_REPO_TEMPLATE: &str = "{{registry}}/hydrosim/{{student_code}}";

/// Cohort a student belongs to. Each class maps to one fixed namespace; the
/// class key is also the middle segment of the public host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "project_class_enum", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProjectClass {
    Gd,
    Cd,
}

serde_plain::derive_display_from_serialize!(ProjectClass);
serde_plain::derive_fromstr_from_deserialize!(ProjectClass);

impl ProjectClass {
    pub const ALL: [ProjectClass; 2] = [ProjectClass::Gd, ProjectClass::Cd];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectClass::Gd => "gd",
            ProjectClass::Cd => "cd",
        }
    }

    /// Namespace the class's student workloads live in.
    #[inline]
    pub fn namespace(&self) -> &'static str {
        match self {
            ProjectClass::Gd => "students-gd",
            ProjectClass::Cd => "students-cd",
        }
    }

    pub fn student_namespaces() -> impl Iterator<Item = &'static str> {
        Self::ALL.iter().map(|c| c.namespace())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "build_status_enum", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
    Error,
    Cancelled,
}

serde_plain::derive_display_from_serialize!(BuildStatus);

impl BuildStatus {
    /// Terminal statuses are sticky; a build never leaves them except for
    /// the one-time log key backfill.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::Error | BuildStatus::Cancelled
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "deployment_status_enum", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Running,
    Failed,
}

serde_plain::derive_display_from_serialize!(DeploymentStatus);

/// How the image tag for a build is derived. Stored as plain text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TagStrategy {
    #[default]
    ShortSha,
    BranchLatest,
}

serde_plain::derive_display_from_serialize!(TagStrategy);

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Student {
    pub id: i64,
    pub student_code: String,
    pub name: String,
    pub project_class: ProjectClass,
    pub teacher_id: Option<i64>,
    pub git_repo_url: Option<String>,
    pub expected_image: Option<String>,
    pub domain: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct BuildConfig {
    pub student_id: i64,
    pub repo_url: String,
    pub branch: String,
    pub dockerfile_path: String,
    pub context_path: String,
    pub registry_id: Option<i64>,
    pub image_repo: Option<String>,
    pub tag_strategy: TagStrategy,
    pub auto_build: bool,
    pub auto_deploy: bool,
    #[serde(skip_serializing)]
    pub deploy_key_public: Option<String>,
    #[serde(skip_serializing)]
    pub deploy_key_private: Option<String>,
    pub deploy_key_fingerprint: Option<String>,
    pub deploy_key_created_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Build {
    pub id: i64,
    pub student_id: i64,
    pub commit_sha: String,
    pub branch: String,
    pub image_tag: Option<String>,
    pub status: BuildStatus,
    pub message: Option<String>,
    pub job_name: Option<String>,
    pub log_object_key: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Record of one deploy attempt. Distinct from the cluster `Deployment`:
/// rows are written before any cluster mutation so failures stay
/// attributable, and are immutable once terminal.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct DeploymentRecord {
    pub id: i64,
    pub student_id: i64,
    pub build_id: Option<i64>,
    pub image: String,
    pub status: DeploymentStatus,
    pub message: Option<String>,
    pub last_deploy_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Registry {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Singleton row; missing columns fall back to the defaults above.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct SystemSetting {
    pub id: i64,
    pub student_domain_prefix: Option<String>,
    pub student_domain_base: Option<String>,
    pub build_namespace: Option<String>,
    pub default_registry_id: Option<i64>,
    pub default_image_repo_template: Option<String>,
}

impl SystemSetting {
    #[inline]
    pub fn domain_prefix(&self) -> &str {
        self.student_domain_prefix
            .as_deref()
            .unwrap_or(DEFAULT_STUDENT_DOMAIN_PREFIX)
    }

    #[inline]
    pub fn domain_base(&self) -> &str {
        self.student_domain_base
            .as_deref()
            .unwrap_or(DEFAULT_STUDENT_DOMAIN_BASE)
    }

    #[inline]
    pub fn build_namespace(&self) -> &str {
        self.build_namespace
            .as_deref()
            .unwrap_or(DEFAULT_BUILD_NAMESPACE)
    }

    #[inline]
    pub fn image_repo_template(&self) -> &str {
        self.default_image_repo_template
            .as_deref()
            .unwrap_or(DEFAULT_IMAGE_REPO_TEMPLATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_class_round_trip() {
        assert_eq!(ProjectClass::Gd.to_string(), "gd");
        assert_eq!("cd".parse::<ProjectClass>().unwrap(), ProjectClass::Cd);
        assert!("platform".parse::<ProjectClass>().is_err());
    }

    #[test]
    fn test_project_class_namespaces() {
        assert_eq!(ProjectClass::Gd.namespace(), "students-gd");
        assert_eq!(ProjectClass::Cd.namespace(), "students-cd");
        assert_eq!(
            ProjectClass::student_namespaces().collect::<Vec<_>>(),
            vec!["students-gd", "students-cd"]
        );
    }

    #[test]
    fn test_build_status_terminality() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Success.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::Error.is_terminal());
        assert!(BuildStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_tag_strategy_wire_form() {
        assert_eq!(TagStrategy::ShortSha.to_string(), "short_sha");
        assert_eq!(TagStrategy::BranchLatest.to_string(), "branch_latest");
    }

    #[test]
    fn test_settings_defaults() {
        let setting = SystemSetting {
            id: 1,
            student_domain_prefix: None,
            student_domain_base: None,
            build_namespace: None,
            default_registry_id: None,
            default_image_repo_template: None,
        };
        assert_eq!(setting.domain_prefix(), "stu-");
        assert_eq!(setting.domain_base(), "hydrosim.cn");
        assert_eq!(setting.build_namespace(), "hydrosim");
        assert_eq!(
            setting.image_repo_template(),
            "{{registry}}/hydrosim/{{student_code}}"
        );
    }
}
