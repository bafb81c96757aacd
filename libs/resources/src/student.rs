use portal_k8s_util::naming::{student_dns_label, student_resource_name};

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecurityContext, Service, ServicePort, ServiceSpec, TCPSocketAction,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "portal-controller";

const CONTAINER_NAME: &str = "app";
const CONTAINER_PORT: i32 = 8000;
const PORT_NAME: &str = "http";
const VOLUME_DATA_NAME: &str = "data";
const RUN_AS_USER: i64 = 1000;

pub const TRAEFIK_INGRESS_CLASS: &str = "traefik";
pub const ANNOTATION_INGRESS_CLASS: &str = "kubernetes.io/ingress.class";
pub const ANNOTATION_ENTRYPOINTS: &str = "traefik.ingress.kubernetes.io/router.entrypoints";
pub const ANNOTATION_ROUTER_TLS: &str = "traefik.ingress.kubernetes.io/router.tls";
pub const ENTRYPOINTS_PLAIN: &str = "web";
pub const ENTRYPOINTS_TLS: &str = "web,websecure";

/// Persistent storage knobs; installation-wide rather than per-student.
#[derive(Clone, Debug)]
pub struct VolumeOptions {
    pub enabled: bool,
    pub size: String,
    pub storage_class: Option<String>,
    pub mount_path: String,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            size: "1Gi".to_string(),
            storage_class: None,
            mount_path: "/data".to_string(),
        }
    }
}

/// Builder for the object graph of one student workload. All emitted objects
/// share the resource name `student-{label}` and the same label set, so the
/// Deployment, Service and Ingress always select each other.
#[derive(Clone, Debug)]
pub struct StudentWorkload {
    student_code: String,
    resource_name: String,
    dns_label: String,
    image: String,
    namespace: String,
    domain_suffix: String,
    host_prefix: String,
    volume: VolumeOptions,
    tls_secret_name: Option<String>,
}

impl StudentWorkload {
    pub fn new(
        student_code: &str,
        image: &str,
        namespace: &str,
        domain_suffix: &str,
        host_prefix: &str,
    ) -> Self {
        Self {
            student_code: student_code.to_string(),
            resource_name: student_resource_name(student_code),
            dns_label: student_dns_label(student_code),
            image: image.to_string(),
            namespace: namespace.to_string(),
            domain_suffix: domain_suffix.trim_start_matches('.').to_string(),
            host_prefix: host_prefix.to_string(),
            volume: VolumeOptions::default(),
            tls_secret_name: None,
        }
    }

    pub fn with_volume(mut self, volume: VolumeOptions) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_tls_secret(mut self, tls_secret_name: Option<String>) -> Self {
        self.tls_secret_name = tls_secret_name;
        self
    }

    #[inline]
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[inline]
    pub fn pvc_name(&self) -> String {
        format!("{}-data", self.resource_name)
    }

    /// Public host of the workload: `{prefix}{label}.{domain_suffix}`.
    pub fn host(&self) -> String {
        format!("{}{}.{}", self.host_prefix, self.dns_label, self.domain_suffix)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), self.resource_name.clone()),
            ("student".to_string(), self.student_code.clone()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        ])
    }

    fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            ..ObjectMeta::default()
        }
    }

    /// Pod template shared by the create and the image-update paths; the
    /// controller patches `.spec.template` with exactly this object so probe,
    /// resource and env changes always propagate.
    pub fn pod_template(&self) -> PodTemplateSpec {
        let mut env = vec![
            EnvVar {
                name: "STUDENT_CODE".to_string(),
                value: Some(self.student_code.clone()),
                ..EnvVar::default()
            },
            EnvVar {
                name: "APP_NAME".to_string(),
                value: Some(self.resource_name.clone()),
                ..EnvVar::default()
            },
        ];
        let mut volume_mounts = Vec::new();
        let mut volumes = Vec::new();
        if self.volume.enabled {
            volume_mounts.push(VolumeMount {
                name: VOLUME_DATA_NAME.to_string(),
                mount_path: self.volume.mount_path.clone(),
                ..VolumeMount::default()
            });
            volumes.push(Volume {
                name: VOLUME_DATA_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: self.pvc_name(),
                    ..PersistentVolumeClaimVolumeSource::default()
                }),
                ..Volume::default()
            });
            env.push(EnvVar {
                name: "DATA_DIR".to_string(),
                value: Some(self.volume.mount_path.clone()),
                ..EnvVar::default()
            });
            env.push(EnvVar {
                name: "DB_FILE".to_string(),
                value: Some(format!("{}/app.db", self.volume.mount_path)),
                ..EnvVar::default()
            });
        }

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            image_pull_policy: Some("Always".to_string()),
            ports: Some(vec![ContainerPort {
                container_port: CONTAINER_PORT,
                name: Some(PORT_NAME.to_string()),
                ..ContainerPort::default()
            }]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity("100m".to_string())),
                    ("memory".to_string(), Quantity("128Mi".to_string())),
                ])),
                limits: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity("500m".to_string())),
                    ("memory".to_string(), Quantity("512Mi".to_string())),
                ])),
                ..ResourceRequirements::default()
            }),
            env: Some(env),
            security_context: Some(SecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(RUN_AS_USER),
                allow_privilege_escalation: Some(false),
                ..SecurityContext::default()
            }),
            // Traffic is held back until the TCP check passes, so a rolling
            // update never kills the old pod before the new one answers.
            readiness_probe: Some(tcp_probe(5, 10)),
            liveness_probe: Some(tcp_probe(15, 20)),
            volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
            ..Container::default()
        };

        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(self.labels()),
                ..ObjectMeta::default()
            }),
            spec: Some(PodSpec {
                containers: vec![container],
                volumes: (!volumes.is_empty()).then_some(volumes),
                security_context: self.volume.enabled.then_some(PodSecurityContext {
                    fs_group: Some(RUN_AS_USER),
                    ..PodSecurityContext::default()
                }),
                restart_policy: Some("Always".to_string()),
                ..PodSpec::default()
            }),
        }
    }

    pub fn deployment(&self) -> Deployment {
        Deployment {
            metadata: self.metadata(&self.resource_name),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_expressions: None,
                    match_labels: Some(self.labels()),
                },
                template: self.pod_template(),
                progress_deadline_seconds: Some(600),
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateDeployment {
                        max_surge: Some(IntOrString::Int(1)),
                        max_unavailable: Some(IntOrString::Int(0)),
                    }),
                }),
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }
    }

    pub fn service(&self) -> Service {
        Service {
            metadata: self.metadata(&self.resource_name),
            spec: Some(ServiceSpec {
                selector: Some(self.labels()),
                ports: Some(vec![ServicePort {
                    name: Some(PORT_NAME.to_string()),
                    port: 80,
                    target_port: Some(IntOrString::String(PORT_NAME.to_string())),
                    ..ServicePort::default()
                }]),
                type_: Some("ClusterIP".to_string()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    pub fn persistent_volume_claim(&self) -> Option<PersistentVolumeClaim> {
        if !self.volume.enabled {
            return None;
        }
        Some(PersistentVolumeClaim {
            metadata: self.metadata(&self.pvc_name()),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(self.volume.size.clone()),
                    )])),
                    ..VolumeResourceRequirements::default()
                }),
                storage_class_name: self.volume.storage_class.clone(),
                ..PersistentVolumeClaimSpec::default()
            }),
            ..PersistentVolumeClaim::default()
        })
    }

    pub fn ingress_annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::from([
            (
                ANNOTATION_INGRESS_CLASS.to_string(),
                TRAEFIK_INGRESS_CLASS.to_string(),
            ),
            (
                ANNOTATION_ENTRYPOINTS.to_string(),
                if self.tls_secret_name.is_some() {
                    ENTRYPOINTS_TLS.to_string()
                } else {
                    ENTRYPOINTS_PLAIN.to_string()
                },
            ),
        ]);
        if self.tls_secret_name.is_some() {
            annotations.insert(ANNOTATION_ROUTER_TLS.to_string(), "true".to_string());
        }
        annotations
    }

    pub fn ingress(&self) -> Ingress {
        let host = self.host();
        let rule = IngressRule {
            host: Some(host.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: self.resource_name.clone(),
                            port: Some(ServiceBackendPort {
                                number: Some(80),
                                ..ServiceBackendPort::default()
                            }),
                        }),
                        ..IngressBackend::default()
                    },
                }],
            }),
        };

        let tls = self.tls_secret_name.as_ref().map(|secret_name| {
            vec![IngressTLS {
                hosts: Some(vec![host.clone()]),
                secret_name: Some(secret_name.clone()),
            }]
        });

        Ingress {
            metadata: ObjectMeta {
                annotations: Some(self.ingress_annotations()),
                ..self.metadata(&self.resource_name)
            },
            spec: Some(IngressSpec {
                ingress_class_name: self
                    .tls_secret_name
                    .is_some()
                    .then(|| TRAEFIK_INGRESS_CLASS.to_string()),
                rules: Some(vec![rule]),
                tls,
                ..IngressSpec::default()
            }),
            ..Ingress::default()
        }
    }
}

fn tcp_probe(initial_delay_seconds: i32, period_seconds: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(CONTAINER_PORT),
            ..TCPSocketAction::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(period_seconds),
        failure_threshold: Some(3),
        ..Probe::default()
    }
}
