use crate::actor::{self, Actor};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::settings::student_domain_parts;

use portal_k8s_util::naming::student_resource_name;
use portal_k8s_util::retry::with_backoff;
use portal_resources::student::StudentWorkload;
use portal_store::model::{ProjectClass, Student};
use portal_store::repo;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::Client;
use kube::api::{Api, Patch, PatchParams, PostParams};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, instrument};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyResult {
    Created,
    Updated,
}

serde_plain::derive_display_from_serialize!(ApplyResult);

#[derive(Clone, Debug, Serialize)]
pub struct DeployOutcome {
    pub status: ApplyResult,
    pub message: String,
    pub url: String,
    pub record_id: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStatus {
    Deleted,
    NotFound,
}

serde_plain::derive_display_from_serialize!(DeleteStatus);

#[derive(Clone, Debug, Serialize)]
pub struct DeleteOutcome {
    pub status: DeleteStatus,
    pub deleted: Vec<String>,
    pub errors: Vec<String>,
}

/// Reconcile the desired (student, image) pair into cluster state.
///
/// A deployment record is inserted before any cluster call so that every
/// attempt stays attributable; the record flips to `running` or `failed`
/// with the operator-facing message.
#[instrument(skip(ctx, actor, student), fields(student = %student.student_code))]
pub async fn deploy(
    ctx: &Context,
    actor: &Actor,
    student: &Student,
    image: &str,
    class: ProjectClass,
    build_id: Option<i64>,
) -> Result<DeployOutcome> {
    actor::ensure_can_deploy(actor, student)?;
    if student.project_class != class {
        return Err(Error::InvalidInput(format!(
            "student {} does not belong to class {class}",
            student.student_code
        )));
    }

    let setting = repo::get_or_create_settings(&ctx.db)
        .await
        .map_err(|e| Error::db("failed to load system settings", e))?;
    let parts = student_domain_parts(&setting, &student.student_code, class);

    let record = repo::insert_deployment(&ctx.db, student.id, image, build_id, "Deployment requested")
        .await
        .map_err(|e| Error::db("failed to insert deployment record", e))?;

    info!(
        msg = "starting deployment",
        namespace = class.namespace(),
        image,
        record_id = record.id
    );

    let workload = StudentWorkload::new(
        &student.student_code,
        image,
        class.namespace(),
        &parts.domain_suffix,
        &parts.host_prefix,
    )
    .with_volume(ctx.volume.clone())
    .with_tls_secret(ctx.tls_secret_name.clone());

    match apply_workload(ctx.client.clone(), &workload).await {
        Ok(result) => {
            let message = format!(
                "Project {} successfully {result}",
                workload.resource_name()
            );
            repo::mark_deployment_running(&ctx.db, record.id, &message)
                .await
                .map_err(|e| Error::db("failed to finalize deployment record", e))?;
            if student.domain.as_deref() != Some(parts.full_domain.as_str()) {
                repo::update_student_domain(&ctx.db, student.id, &parts.full_domain)
                    .await
                    .map_err(|e| Error::db("failed to update student domain", e))?;
            }
            ctx.metrics.deploy_inc(&result.to_string());
            Ok(DeployOutcome {
                status: result,
                message,
                url: format!("http://{}", parts.full_domain),
                record_id: record.id,
            })
        }
        Err(e) => {
            error!(msg = "deployment failed", %e);
            ctx.metrics.deploy_inc("failed");
            let reason = failure_message(&e);
            // The record must carry the reason even when the cluster is
            // unhealthy; a second DB failure here would mask the root cause.
            if let Err(db_err) = repo::mark_deployment_failed(&ctx.db, record.id, &reason).await {
                error!(msg = "failed to record deployment failure", %db_err);
            }
            Err(e)
        }
    }
}

/// Delete the student's Ingress, Service and Deployment, in that order.
/// 404 per resource counts as success; other failures are collected so one
/// stuck kind does not leave the rest behind.
pub async fn delete(
    ctx: &Context,
    actor: &Actor,
    student: &Student,
    class: ProjectClass,
) -> Result<DeleteOutcome> {
    actor::ensure_can_delete(actor, student)?;
    if student.project_class != class {
        return Err(Error::InvalidInput(format!(
            "student {} does not belong to class {class}",
            student.student_code
        )));
    }
    delete_workload(ctx.client.clone(), &student.student_code, class).await
}

/// Cluster half of `deploy`; separated so it can be exercised against a mock
/// API server without a database.
pub async fn apply_workload(client: Client, workload: &StudentWorkload) -> Result<ApplyResult> {
    let namespace = workload.namespace();
    let name = workload.resource_name();

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let existing = deployments.get_opt(name).await.map_err(|e| {
        Error::cluster(format!("failed to read Deployment {namespace}/{name}"), e)
    })?;

    let result = match existing {
        None => {
            if let Some(pvc) = workload.persistent_volume_claim() {
                let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
                create_ignoring_conflict(&pvcs, &pvc, "PersistentVolumeClaim").await?;
            }
            let deployment = workload.deployment();
            with_backoff(|| async { deployments.create(&PostParams::default(), &deployment).await })
                .await
                .map_err(|e| {
                    Error::cluster(format!("failed to create Deployment {namespace}/{name}"), e)
                })?;
            let services: Api<Service> = Api::namespaced(client.clone(), namespace);
            create_ignoring_conflict(&services, &workload.service(), "Service").await?;
            let ingresses: Api<Ingress> = Api::namespaced(client.clone(), namespace);
            create_ignoring_conflict(&ingresses, &workload.ingress(), "Ingress").await?;
            ApplyResult::Created
        }
        Some(_) => {
            // Full template replace, so probe, resource and env changes
            // propagate along with the image.
            let patch = json!({"spec": {"template": workload.pod_template()}});
            with_backoff(|| async {
                deployments
                    .patch(name, &PatchParams::default(), &Patch::Strategic(patch.clone()))
                    .await
            })
            .await
            .map_err(|e| {
                Error::cluster(format!("failed to patch Deployment {namespace}/{name}"), e)
            })?;
            ApplyResult::Updated
        }
    };

    reconcile_ingress(client, workload).await?;
    Ok(result)
}

/// Bring the Ingress in line with the freshly built annotations and spec
/// regardless of which path the Deployment took.
async fn reconcile_ingress(client: Client, workload: &StudentWorkload) -> Result<()> {
    let namespace = workload.namespace();
    let name = workload.resource_name();
    let ingresses: Api<Ingress> = Api::namespaced(client, namespace);
    let desired = workload.ingress();

    let existing = ingresses.get_opt(name).await.map_err(|e| {
        Error::cluster(format!("failed to read Ingress {namespace}/{name}"), e)
    })?;
    match existing {
        Some(_) => {
            let patch = json!({
                "metadata": {"annotations": desired.metadata.annotations},
                "spec": desired.spec,
            });
            with_backoff(|| async {
                ingresses
                    .patch(name, &PatchParams::default(), &Patch::Merge(patch.clone()))
                    .await
            })
            .await
            .map_err(|e| {
                Error::cluster(format!("failed to patch Ingress {namespace}/{name}"), e)
            })?;
        }
        None => {
            create_ignoring_conflict(&ingresses, &desired, "Ingress").await?;
        }
    }
    Ok(())
}

pub async fn delete_workload(
    client: Client,
    student_code: &str,
    class: ProjectClass,
) -> Result<DeleteOutcome> {
    let namespace = class.namespace();
    let name = student_resource_name(student_code);
    let mut deleted = Vec::new();
    let mut errors = Vec::new();

    delete_one::<Ingress>(&client, namespace, &name, "Ingress", &mut deleted, &mut errors).await;
    delete_one::<Service>(&client, namespace, &name, "Service", &mut deleted, &mut errors).await;
    delete_one::<Deployment>(&client, namespace, &name, "Deployment", &mut deleted, &mut errors)
        .await;

    let status = if deleted.is_empty() && errors.is_empty() {
        DeleteStatus::NotFound
    } else {
        DeleteStatus::Deleted
    };
    Ok(DeleteOutcome {
        status,
        deleted,
        errors,
    })
}

async fn delete_one<K>(
    client: &Client,
    namespace: &str,
    name: &str,
    kind: &str,
    deleted: &mut Vec<String>,
    errors: &mut Vec<String>,
) where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::de::DeserializeOwned,
    <K as kube::Resource>::DynamicType: Default,
{
    let api = Api::<K>::namespaced(client.clone(), namespace);
    match api.delete(name, &Default::default()).await {
        Ok(_) => deleted.push(kind.to_string()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => errors.push(format!("failed to delete {kind} {namespace}/{name}: {e}")),
    }
}

async fn create_ignoring_conflict<K>(api: &Api<K>, obj: &K, kind: &str) -> Result<()>
where
    K: Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned,
{
    match with_backoff(|| async { api.create(&PostParams::default(), obj).await }).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(Error::cluster(format!("failed to create {kind}"), e)),
    }
}

fn failure_message(err: &Error) -> String {
    match err {
        Error::ClusterError(_, source) => match source.as_ref() {
            kube::Error::Api(ae) => format!("Kubernetes operation failed: {}", ae.reason),
            other => format!("Kubernetes operation failed: {other}"),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use portal_resources::student::VolumeOptions;

    use http::{Request, Response};
    use kube::client::Body;
    use serde_json::Value;

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    fn mock_client() -> (Client, ApiServerHandle) {
        let (mock_service, handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        (Client::new(mock_service, "default"), handle)
    }

    fn workload(image: &str) -> StudentWorkload {
        StudentWorkload::new("A1", image, "students-gd", "gd.hydrosim.cn", "stu-")
            .with_volume(VolumeOptions::default())
    }

    async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    async fn echo_request_body(handle: &mut ApiServerHandle, method: http::Method, path: &str) {
        let (request, send) = handle.next_request().await.expect("service not called");
        assert_eq!(request.method(), method, "unexpected method for {path}");
        assert_eq!(request.uri().path(), path);
        let body = request.into_body().collect_bytes().await.unwrap();
        send.send_response(Response::builder().body(Body::from(body.to_vec())).unwrap());
    }

    fn not_found() -> Response<Body> {
        Response::builder().status(404).body(Body::empty()).unwrap()
    }

    fn status_success() -> Response<Body> {
        let body = serde_json::to_vec(&serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Success"
        }))
        .unwrap();
        Response::builder().body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn test_apply_workload_first_deploy_creates_everything() {
        let (client, mut handle) = mock_client();
        let mock = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().path(),
                "/apis/apps/v1/namespaces/students-gd/deployments/student-a1"
            );
            send.send_response(not_found());

            echo_request_body(
                &mut handle,
                http::Method::POST,
                "/api/v1/namespaces/students-gd/persistentvolumeclaims",
            )
            .await;

            let (request, send) = handle.next_request().await.expect("deployment not created");
            assert_eq!(request.method(), http::Method::POST);
            assert_eq!(
                request.uri().path(),
                "/apis/apps/v1/namespaces/students-gd/deployments"
            );
            let body = request.into_body().collect_bytes().await.unwrap();
            let deployment: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(
                deployment["spec"]["template"]["spec"]["containers"][0]["image"],
                "nginx:alpine"
            );
            assert_eq!(deployment["metadata"]["name"], "student-a1");
            send.send_response(Response::builder().body(Body::from(body.to_vec())).unwrap());

            echo_request_body(
                &mut handle,
                http::Method::POST,
                "/api/v1/namespaces/students-gd/services",
            )
            .await;

            let (request, send) = handle.next_request().await.expect("ingress not created");
            assert_eq!(request.method(), http::Method::POST);
            assert_eq!(
                request.uri().path(),
                "/apis/networking.k8s.io/v1/namespaces/students-gd/ingresses"
            );
            let body = request.into_body().collect_bytes().await.unwrap();
            let ingress: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(
                ingress["spec"]["rules"][0]["host"],
                "stu-a1.gd.hydrosim.cn"
            );
            send.send_response(Response::builder().body(Body::from(body.to_vec())).unwrap());

            // unconditional ingress reconcile
            let (request, send) = handle.next_request().await.expect("ingress not read");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().path(),
                "/apis/networking.k8s.io/v1/namespaces/students-gd/ingresses/student-a1"
            );
            let body = serde_json::to_vec(&serde_json::json!({
                "apiVersion": "networking.k8s.io/v1",
                "kind": "Ingress",
                "metadata": {"name": "student-a1", "namespace": "students-gd"}
            }))
            .unwrap();
            send.send_response(Response::builder().body(Body::from(body)).unwrap());

            echo_request_body(
                &mut handle,
                http::Method::PATCH,
                "/apis/networking.k8s.io/v1/namespaces/students-gd/ingresses/student-a1",
            )
            .await;
        });

        let result = apply_workload(client, &workload("nginx:alpine")).await.unwrap();
        assert_eq!(result, ApplyResult::Created);
        timeout_after_1s(mock).await;
    }

    #[tokio::test]
    async fn test_apply_workload_update_patches_template() {
        let (client, mut handle) = mock_client();
        let mock = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            let body = serde_json::to_vec(&serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "student-a1", "namespace": "students-gd"},
                "spec": {
                    "replicas": 1,
                    "selector": {"matchLabels": {"app": "student-a1"}},
                    "template": {"metadata": {}, "spec": {"containers": [
                        {"name": "app", "image": "nginx:alpine"}
                    ]}}
                }
            }))
            .unwrap();
            send.send_response(Response::builder().body(Body::from(body)).unwrap());

            let (request, send) = handle.next_request().await.expect("deployment not patched");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().path(),
                "/apis/apps/v1/namespaces/students-gd/deployments/student-a1"
            );
            let body = request.into_body().collect_bytes().await.unwrap();
            let patch: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(
                patch["spec"]["template"]["spec"]["containers"][0]["image"],
                "nginx:1.25"
            );
            let response = serde_json::to_vec(&serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "student-a1", "namespace": "students-gd"}
            }))
            .unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());

            // ingress reconcile: absent, so it is created
            let (request, send) = handle.next_request().await.expect("ingress not read");
            assert_eq!(request.method(), http::Method::GET);
            send.send_response(not_found());
            echo_request_body(
                &mut handle,
                http::Method::POST,
                "/apis/networking.k8s.io/v1/namespaces/students-gd/ingresses",
            )
            .await;
        });

        let result = apply_workload(client, &workload("nginx:1.25")).await.unwrap();
        assert_eq!(result, ApplyResult::Updated);
        timeout_after_1s(mock).await;
    }

    #[tokio::test]
    async fn test_apply_workload_tolerates_conflicts_on_subsidiaries() {
        let (client, mut handle) = mock_client();
        let mock = tokio::spawn(async move {
            let (_, send) = handle.next_request().await.expect("service not called");
            send.send_response(not_found());

            let conflict = || {
                let body = serde_json::to_vec(&serde_json::json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "metadata": {},
                    "status": "Failure",
                    "message": "already exists",
                    "reason": "AlreadyExists",
                    "code": 409
                }))
                .unwrap();
                Response::builder().status(409).body(Body::from(body)).unwrap()
            };

            // PVC and Service creation hit 409; the deploy carries on.
            let (_, send) = handle.next_request().await.expect("pvc not created");
            send.send_response(conflict());
            echo_request_body(
                &mut handle,
                http::Method::POST,
                "/apis/apps/v1/namespaces/students-gd/deployments",
            )
            .await;
            let (_, send) = handle.next_request().await.expect("service not created");
            send.send_response(conflict());
            let (_, send) = handle.next_request().await.expect("ingress not created");
            send.send_response(conflict());

            let (_, send) = handle.next_request().await.expect("ingress not read");
            let body = serde_json::to_vec(&serde_json::json!({
                "apiVersion": "networking.k8s.io/v1",
                "kind": "Ingress",
                "metadata": {"name": "student-a1", "namespace": "students-gd"}
            }))
            .unwrap();
            send.send_response(Response::builder().body(Body::from(body)).unwrap());
            echo_request_body(
                &mut handle,
                http::Method::PATCH,
                "/apis/networking.k8s.io/v1/namespaces/students-gd/ingresses/student-a1",
            )
            .await;
        });

        let result = apply_workload(client, &workload("nginx:alpine")).await.unwrap();
        assert_eq!(result, ApplyResult::Created);
        timeout_after_1s(mock).await;
    }

    #[tokio::test]
    async fn test_delete_workload_reports_deleted_kinds() {
        let (client, mut handle) = mock_client();
        let mock = tokio::spawn(async move {
            for path in [
                "/apis/networking.k8s.io/v1/namespaces/students-gd/ingresses/student-a1",
                "/api/v1/namespaces/students-gd/services/student-a1",
                "/apis/apps/v1/namespaces/students-gd/deployments/student-a1",
            ] {
                let (request, send) = handle.next_request().await.expect("service not called");
                assert_eq!(request.method(), http::Method::DELETE);
                assert_eq!(request.uri().path(), path);
                send.send_response(status_success());
            }
        });
        let outcome = delete_workload(client, "A1", ProjectClass::Gd).await.unwrap();
        assert_eq!(outcome.status, DeleteStatus::Deleted);
        assert_eq!(outcome.deleted, vec!["Ingress", "Service", "Deployment"]);
        assert!(outcome.errors.is_empty());
        timeout_after_1s(mock).await;
    }

    #[tokio::test]
    async fn test_delete_workload_twice_is_not_found() {
        let (client, mut handle) = mock_client();
        let mock = tokio::spawn(async move {
            for _ in 0..3 {
                let (_, send) = handle.next_request().await.expect("service not called");
                send.send_response(not_found());
            }
        });
        let outcome = delete_workload(client, "A1", ProjectClass::Gd).await.unwrap();
        assert_eq!(outcome.status, DeleteStatus::NotFound);
        assert!(outcome.deleted.is_empty());
        assert!(outcome.errors.is_empty());
        timeout_after_1s(mock).await;
    }
}
