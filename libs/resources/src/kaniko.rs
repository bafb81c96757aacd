use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume,
    VolumeMount,
};
use kube::api::ObjectMeta;

const GIT_CLONE_IMAGE: &str = "alpine/git:latest";
const KANIKO_IMAGE: &str = "gcr.io/kaniko-project/executor:latest";
pub const GIT_CLONE_CONTAINER: &str = "git-clone";
pub const KANIKO_CONTAINER: &str = "kaniko";
pub const REPO_DIR: &str = "/workspace/repo";

const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_MOUNT: &str = "/workspace";
const GIT_SECRET_VOLUME: &str = "git-secret";
const GIT_SECRET_MOUNT: &str = "/etc/ssh-key";
const REGISTRY_VOLUME: &str = "registry-config";
const REGISTRY_MOUNT: &str = "/kaniko/.docker/";

/// One-shot Kaniko build: an init container clones the repository into a
/// shared emptyDir, then the executor builds and pushes. The Job never
/// retries; failure diagnosis happens from the archived logs.
#[derive(Clone, Debug)]
pub struct KanikoBuildJob {
    pub job_name: String,
    pub namespace: String,
    pub destinations: Vec<String>,
    pub context_path: String,
    pub dockerfile_path: String,
    pub git_secret_name: Option<String>,
    pub registry_secret_name: Option<String>,
    pub clone_script: String,
    pub extra_labels: BTreeMap<String, String>,
}

impl KanikoBuildJob {
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), "kaniko-build".to_string()),
            ("job-name".to_string(), self.job_name.clone()),
        ])
        .into_iter()
        .chain(self.extra_labels.clone())
        .collect()
    }

    fn kaniko_args(&self) -> Vec<String> {
        [
            format!("--dockerfile={}", dockerfile_path(REPO_DIR, &self.dockerfile_path)),
            format!("--context=dir://{}", context_dir(REPO_DIR, &self.context_path)),
        ]
        .into_iter()
        .chain(
            self.destinations
                .iter()
                .map(|dest| format!("--destination={dest}")),
        )
        .chain(
            [
                "--cache=true",
                "--cache-run-layers=true",
                "--cache-copy-layers=true",
                "--compressed-caching=false",
            ]
            .into_iter()
            .map(str::to_string),
        )
        .collect()
    }

    pub fn job(&self) -> Job {
        let labels = self.labels();

        let mut init_mounts = vec![VolumeMount {
            name: WORKSPACE_VOLUME.to_string(),
            mount_path: WORKSPACE_MOUNT.to_string(),
            ..VolumeMount::default()
        }];
        let mut volumes = vec![Volume {
            name: WORKSPACE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        }];
        if let Some(git_secret_name) = &self.git_secret_name {
            init_mounts.push(VolumeMount {
                name: GIT_SECRET_VOLUME.to_string(),
                mount_path: GIT_SECRET_MOUNT.to_string(),
                read_only: Some(true),
                ..VolumeMount::default()
            });
            volumes.push(Volume {
                name: GIT_SECRET_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(git_secret_name.clone()),
                    optional: Some(false),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            });
        }

        let mut kaniko_mounts = vec![VolumeMount {
            name: WORKSPACE_VOLUME.to_string(),
            mount_path: WORKSPACE_MOUNT.to_string(),
            ..VolumeMount::default()
        }];
        if let Some(registry_secret_name) = &self.registry_secret_name {
            kaniko_mounts.push(VolumeMount {
                name: REGISTRY_VOLUME.to_string(),
                mount_path: REGISTRY_MOUNT.to_string(),
                ..VolumeMount::default()
            });
            volumes.push(Volume {
                name: REGISTRY_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(registry_secret_name.clone()),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            });
        }

        let git_clone = Container {
            name: GIT_CLONE_CONTAINER.to_string(),
            image: Some(GIT_CLONE_IMAGE.to_string()),
            command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            args: Some(vec![self.clone_script.clone()]),
            volume_mounts: Some(init_mounts),
            ..Container::default()
        };

        let kaniko = Container {
            name: KANIKO_CONTAINER.to_string(),
            image: Some(KANIKO_IMAGE.to_string()),
            args: Some(self.kaniko_args()),
            volume_mounts: Some(kaniko_mounts),
            ..Container::default()
        };

        Job {
            metadata: ObjectMeta {
                name: Some(self.job_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(3600),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        init_containers: Some(vec![git_clone]),
                        containers: vec![kaniko],
                        volumes: Some(volumes),
                        ..PodSpec::default()
                    }),
                },
                ..JobSpec::default()
            }),
            ..Job::default()
        }
    }
}

fn normalize_relative_path(path: &str) -> &str {
    let trimmed = path.trim();
    match trimmed {
        "" | "." => ".",
        other => other.trim_start_matches('/'),
    }
}

fn context_dir(repo_dir: &str, context_path: &str) -> String {
    match normalize_relative_path(context_path) {
        "." => repo_dir.to_string(),
        rel => format!("{repo_dir}/{rel}"),
    }
}

fn dockerfile_path(repo_dir: &str, dockerfile: &str) -> String {
    let trimmed = dockerfile.trim();
    if trimmed.starts_with('/') {
        return trimmed.to_string();
    }
    match normalize_relative_path(trimmed) {
        "." => format!("{repo_dir}/Dockerfile"),
        rel => format!("{repo_dir}/{rel}"),
    }
}

/// Shell script the `git-clone` init container runs. SSH URLs stage the
/// deploy key and disable host key checking; a concrete commit wins over the
/// branch, and an unknown branch falls back to the clone default with a
/// warning instead of failing the build.
pub fn clone_script(
    git_url: &str,
    commit_sha: Option<&str>,
    branch: &str,
    git_port: Option<u16>,
) -> String {
    let use_ssh = git_url.starts_with("git@") || git_url.starts_with("ssh://");
    let mut lines = vec!["set -e".to_string()];
    if use_ssh {
        let port_flag = git_port.map(|p| format!(" -p {p}")).unwrap_or_default();
        lines.extend([
            "mkdir -p /root/.ssh".to_string(),
            format!("cp {GIT_SECRET_MOUNT}/id_rsa /root/.ssh/id_rsa"),
            "chmod 600 /root/.ssh/id_rsa".to_string(),
            format!(
                "export GIT_SSH_COMMAND=\"ssh -i /root/.ssh/id_rsa -o StrictHostKeyChecking=no{port_flag}\""
            ),
        ]);
    }
    lines.push(format!("rm -rf {WORKSPACE_MOUNT}/*"));
    lines.push(format!("git clone {git_url} {REPO_DIR}"));
    lines.push(format!("cd {REPO_DIR}"));

    match commit_sha {
        Some(sha) if sha != "latest" => {
            let commit_ref = sha.replace('"', "\\\"");
            lines.push(format!("git checkout \"{commit_ref}\""));
        }
        _ if !branch.is_empty() => {
            let branch_name = branch.replace('"', "\\\"");
            lines.extend([
                format!("if git show-ref --verify --quiet \"refs/heads/{branch_name}\"; then"),
                format!("  git checkout \"{branch_name}\""),
                format!(
                    "elif git show-ref --verify --quiet \"refs/remotes/origin/{branch_name}\"; then"
                ),
                format!("  git checkout -b \"{branch_name}\" \"origin/{branch_name}\""),
                "else".to_string(),
                format!("  echo \"Branch {branch_name} not found, using default\""),
                "fi".to_string(),
            ]);
        }
        _ => {}
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_job() -> KanikoBuildJob {
        KanikoBuildJob {
            job_name: "build-7-abc123".to_string(),
            namespace: "hydrosim".to_string(),
            destinations: vec!["reg.example/ns/a1:deadbee".to_string()],
            context_path: ".".to_string(),
            dockerfile_path: "Dockerfile".to_string(),
            git_secret_name: Some("student-deploy-key-3".to_string()),
            registry_secret_name: Some("kaniko-registry-auth-1".to_string()),
            clone_script: clone_script("git@git.example:user/repo.git", Some("deadbeef"), "main", None),
            extra_labels: BTreeMap::from([
                ("build-id".to_string(), "7".to_string()),
                ("student-id".to_string(), "3".to_string()),
            ]),
        }
    }

    #[test]
    fn test_job_contract() {
        let job = build_job().job();
        assert_eq!(job.metadata.name.as_deref(), Some("build-7-abc123"));
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("app").unwrap(), "kaniko-build");
        assert_eq!(labels.get("job-name").unwrap(), "build-7-abc123");
        assert_eq!(labels.get("build-id").unwrap(), "7");
        assert_eq!(labels.get("student-id").unwrap(), "3");

        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.ttl_seconds_after_finished, Some(3600));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let init = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, "git-clone");
        assert_eq!(init.image.as_deref(), Some("alpine/git:latest"));
        let init_mounts = init.volume_mounts.as_ref().unwrap();
        assert_eq!(init_mounts.len(), 2);
        assert_eq!(init_mounts[1].mount_path, "/etc/ssh-key");
        assert_eq!(init_mounts[1].read_only, Some(true));

        let kaniko = &pod.containers[0];
        assert_eq!(kaniko.name, "kaniko");
        let args = kaniko.args.as_ref().unwrap();
        assert!(args.contains(&"--dockerfile=/workspace/repo/Dockerfile".to_string()));
        assert!(args.contains(&"--context=dir:///workspace/repo".to_string()));
        assert!(args.contains(&"--destination=reg.example/ns/a1:deadbee".to_string()));
        assert!(args.contains(&"--cache=true".to_string()));
        assert!(args.contains(&"--compressed-caching=false".to_string()));
        assert_eq!(
            kaniko.volume_mounts.as_ref().unwrap()[1].mount_path,
            "/kaniko/.docker/"
        );

        let volumes = pod.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 3);
        assert!(volumes[0].empty_dir.is_some());
        assert_eq!(
            volumes[1].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("student-deploy-key-3")
        );
    }

    #[test]
    fn test_job_without_secrets() {
        let mut build = build_job();
        build.git_secret_name = None;
        build.registry_secret_name = None;
        let job = build.job();
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.volumes.as_ref().unwrap().len(), 1);
        assert_eq!(
            pod.init_containers.as_ref().unwrap()[0]
                .volume_mounts
                .as_ref()
                .unwrap()
                .len(),
            1
        );
        assert_eq!(pod.containers[0].volume_mounts.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_context_and_dockerfile_paths() {
        assert_eq!(context_dir(REPO_DIR, "."), "/workspace/repo");
        assert_eq!(context_dir(REPO_DIR, ""), "/workspace/repo");
        assert_eq!(context_dir(REPO_DIR, "backend"), "/workspace/repo/backend");
        assert_eq!(context_dir(REPO_DIR, "/backend"), "/workspace/repo/backend");
        assert_eq!(
            dockerfile_path(REPO_DIR, "Dockerfile"),
            "/workspace/repo/Dockerfile"
        );
        assert_eq!(dockerfile_path(REPO_DIR, ""), "/workspace/repo/Dockerfile");
        assert_eq!(
            dockerfile_path(REPO_DIR, "docker/Dockerfile.prod"),
            "/workspace/repo/docker/Dockerfile.prod"
        );
        assert_eq!(dockerfile_path(REPO_DIR, "/abs/Dockerfile"), "/abs/Dockerfile");
    }

    #[test]
    fn test_clone_script_ssh_with_commit() {
        let script = clone_script(
            "ssh://git@git.internal:2222/user/repo.git",
            Some("deadbeefcafef00d"),
            "main",
            Some(2222),
        );
        assert!(script.starts_with("set -e"));
        assert!(script.contains("cp /etc/ssh-key/id_rsa /root/.ssh/id_rsa"));
        assert!(script.contains("StrictHostKeyChecking=no -p 2222"));
        assert!(script.contains("git clone ssh://git@git.internal:2222/user/repo.git /workspace/repo"));
        assert!(script.contains("git checkout \"deadbeefcafef00d\""));
        assert!(!script.contains("show-ref"));
    }

    #[test]
    fn test_clone_script_https_branch_fallback() {
        let script = clone_script("https://git.example/user/repo.git", Some("latest"), "dev", None);
        assert!(!script.contains("GIT_SSH_COMMAND"));
        assert!(script.contains("refs/heads/dev"));
        assert!(script.contains("refs/remotes/origin/dev"));
        assert!(script.contains("Branch dev not found, using default"));
    }

    #[test]
    fn test_clone_script_escapes_quotes() {
        let script = clone_script("https://git.example/u/r.git", Some("bad\"ref"), "main", None);
        assert!(script.contains("git checkout \"bad\\\"ref\""));
    }
}
