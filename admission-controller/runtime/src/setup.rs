//! One-time registration of the admission controller with the cluster.

use crate::{
    admission::POLICY_PATH,
    core::{
        protect::{OWNERSHIP_LABEL, OWNERSHIP_VALUE},
        workload::WORKLOAD_KINDS,
    },
    k8s::{ObjectMeta, Resource, ResourceExt, SecurityContextConstraints},
};
use anyhow::{Context, Result};
use k8s_openapi::api::{
    admissionregistration::v1::{
        RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
        WebhookClientConfig,
    },
    core::v1::{Pod, Service},
    rbac::v1::{ClusterRoleBinding, RoleRef, Subject},
};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client,
};
use tokio::time;
use tracing::{debug, info, warn};

/// The name of the webhook configuration; webhooks are named
/// `<resource>.<WEBHOOK_CONFIGURATION>`.
pub const WEBHOOK_CONFIGURATION: &str = "aro-admission-controller.redhat.com";

pub const SERVICE_NAME: &str = "aro-admission-controller";

const COMPONENT_SELECTOR: &str = "openshift.io/component=aro-admission-controller";
const FIELD_MANAGER: &str = "aro-admission-controller";

const ROLE_BINDING_NAME: &str = "aro-admission-controller";
const PRIVILEGED_ROLE: &str = "privileged-creator";
const CUSTOMER_ADMINS_GROUP: &str = "osa-customer-admins";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

const POLL_INTERVAL: time::Duration = time::Duration::from_secs(5);
const WRITE_TIMEOUT: time::Duration = time::Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct Params {
    /// The namespace in which the controller's pods and service run.
    pub namespace: String,
    /// The number of pods that must be ready before webhooks are registered.
    pub replicas: usize,
}

/// Waits for the controller to become available and then registers its
/// webhooks, marks existing SCCs as locally owned and grants the customer
/// administrators the privileged-creator role.
pub async fn run(client: Client, params: Params) -> Result<()> {
    wait_for_pods(&client, &params).await?;
    wait_for_service(&client, &params.namespace).await?;

    // Labels are applied before the webhooks fail closed so that updates to
    // existing SCCs are not rejected while registration is incomplete.
    label_policies(&client).await?;

    let webhooks = webhook_configuration(&params.namespace);
    let api = Api::<ValidatingWebhookConfiguration>::all(client.clone());
    time::timeout(
        WRITE_TIMEOUT,
        api.patch(
            WEBHOOK_CONFIGURATION,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(webhooks),
        ),
    )
    .await
    .context("timed out applying webhook configuration")?
    .context("failed to apply webhook configuration")?;
    info!(name = %WEBHOOK_CONFIGURATION, "Applied webhook configuration");

    let api = Api::<ClusterRoleBinding>::all(client);
    time::timeout(
        WRITE_TIMEOUT,
        api.patch(
            ROLE_BINDING_NAME,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(role_binding()),
        ),
    )
    .await
    .context("timed out applying cluster role binding")?
    .context("failed to apply cluster role binding")?;
    info!(name = %ROLE_BINDING_NAME, role = %PRIVILEGED_ROLE, "Applied cluster role binding");

    Ok(())
}

/// Builds a webhook for every workload kind plus one for security context
/// constraints, all served by the controller's service.
pub fn webhook_configuration(namespace: &str) -> ValidatingWebhookConfiguration {
    const WRITES: &[&str] = &["CREATE", "UPDATE"];

    let workloads = WORKLOAD_KINDS.iter().map(|kind| {
        webhook(
            namespace,
            kind.path,
            rule(kind.groups, kind.versions, kind.resource, WRITES),
        )
    });

    let dt = ();
    let group = SecurityContextConstraints::group(&dt);
    let version = SecurityContextConstraints::version(&dt);
    let plural = SecurityContextConstraints::plural(&dt);
    let policies = webhook(
        namespace,
        POLICY_PATH,
        rule(
            &[group.as_ref()],
            &[version.as_ref()],
            plural.as_ref(),
            &["CREATE", "UPDATE", "DELETE"],
        ),
    );

    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CONFIGURATION.to_string()),
            ..Default::default()
        },
        webhooks: Some(workloads.chain(Some(policies)).collect()),
    }
}

fn rule(
    groups: &[&str],
    versions: &[&str],
    resource: &str,
    operations: &[&str],
) -> RuleWithOperations {
    let strings = |s: &[&str]| s.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    RuleWithOperations {
        api_groups: Some(strings(groups)),
        api_versions: Some(strings(versions)),
        operations: Some(strings(operations)),
        resources: Some(vec![resource.to_string()]),
        ..Default::default()
    }
}

fn webhook(namespace: &str, path: &str, rule: RuleWithOperations) -> ValidatingWebhook {
    let resource = rule
        .resources
        .as_ref()
        .and_then(|r| r.first())
        .cloned()
        .unwrap_or_default();
    ValidatingWebhook {
        name: format!("{resource}.{WEBHOOK_CONFIGURATION}"),
        admission_review_versions: vec!["v1".to_string(), "v1beta1".to_string()],
        client_config: WebhookClientConfig {
            service: Some(ServiceReference {
                name: SERVICE_NAME.to_string(),
                namespace: namespace.to_string(),
                path: Some(path.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        failure_policy: Some("Fail".to_string()),
        side_effects: "None".to_string(),
        rules: Some(vec![rule]),
        ..Default::default()
    }
}

fn role_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(ROLE_BINDING_NAME.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: PRIVILEGED_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            api_group: Some(RBAC_GROUP.to_string()),
            kind: "Group".to_string(),
            name: CUSTOMER_ADMINS_GROUP.to_string(),
            namespace: None,
        }]),
    }
}

async fn wait_for_pods(client: &Client, params: &Params) -> Result<()> {
    let api = Api::<Pod>::namespaced(client.clone(), &params.namespace);
    let lp = ListParams::default().labels(COMPONENT_SELECTOR);
    loop {
        let pods = api.list(&lp).await.context("failed to list pods")?;
        let ready = pods.items.iter().filter(|pod| is_ready(pod)).count();
        if pods.items.len() == params.replicas && ready == params.replicas {
            info!(ready, "Controller pods are ready");
            return Ok(());
        }
        debug!(pods = pods.items.len(), ready, expected = params.replicas, "Waiting for pods");
        time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_for_service(client: &Client, namespace: &str) -> Result<()> {
    let api = Api::<Service>::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(COMPONENT_SELECTOR);
    loop {
        let services = api.list(&lp).await.context("failed to list services")?;
        if !services.items.is_empty() {
            info!(services = services.items.len(), "Controller service exists");
            return Ok(());
        }
        debug!("Waiting for service");
        time::sleep(POLL_INTERVAL).await;
    }
}

/// Marks every existing SCC as locally owned. A failure to label one SCC is
/// logged and does not prevent the others from being labeled.
async fn label_policies(client: &Client) -> Result<()> {
    let api = Api::<SecurityContextConstraints>::all(client.clone());
    let sccs = api
        .list(&ListParams::default())
        .await
        .context("failed to list security context constraints")?;

    let patch = Patch::Merge(ownership_patch());
    let mut failed = 0;
    for scc in sccs.items {
        let name = scc.name_any();
        match time::timeout(WRITE_TIMEOUT, api.patch(&name, &PatchParams::default(), &patch)).await
        {
            Ok(Ok(_)) => debug!(%name, "Labeled SCC"),
            Ok(Err(error)) => {
                warn!(%name, %error, "Failed to label SCC");
                failed += 1;
            }
            Err(_) => {
                warn!(%name, timeout = ?WRITE_TIMEOUT, "Timed out labeling SCC");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        warn!(failed, "Some SCCs were not labeled");
    }
    Ok(())
}

fn ownership_patch() -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "labels": { OWNERSHIP_LABEL: OWNERSHIP_VALUE },
        },
    })
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hyper::http::{self, Method};
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use serde_json::json;
    use std::{
        convert::Infallible,
        sync::{Arc, Mutex},
    };

    type Requests = Arc<Mutex<Vec<String>>>;

    /// A client whose API server holds the controller's ready pod and service
    /// and the `anyuid` and `restricted` SCCs, of which `failing` cannot be
    /// patched. Every request is recorded as `<method> <path>`.
    fn cluster(failing: &'static str) -> (Client, Requests) {
        let requests = Requests::default();
        let recorded = requests.clone();
        let service = tower::service_fn(move |req: http::Request<kube::client::Body>| {
            let method = req.method().clone();
            let path = req.uri().path().to_string();
            recorded
                .lock()
                .unwrap()
                .push(format!("{method} {path}"));

            let name = path.rsplit('/').next().unwrap_or_default().to_string();
            let get = method == Method::GET;
            let (status, body) = match () {
                _ if get && path.ends_with("/pods") => (
                    http::StatusCode::OK,
                    json!({
                        "apiVersion": "v1",
                        "kind": "PodList",
                        "metadata": {},
                        "items": [{
                            "metadata": { "name": "aro-admission-controller-0" },
                            "status": { "conditions": [{ "type": "Ready", "status": "True" }] },
                        }],
                    }),
                ),
                _ if get && path.ends_with("/services") => (
                    http::StatusCode::OK,
                    json!({
                        "apiVersion": "v1",
                        "kind": "ServiceList",
                        "metadata": {},
                        "items": [{ "metadata": { "name": SERVICE_NAME } }],
                    }),
                ),
                _ if get => (
                    http::StatusCode::OK,
                    json!({
                        "apiVersion": "security.openshift.io/v1",
                        "kind": "SecurityContextConstraintsList",
                        "metadata": {},
                        "items": [
                            { "metadata": { "name": "anyuid" } },
                            { "metadata": { "name": "restricted" } },
                        ],
                    }),
                ),
                _ if name == failing => (
                    http::StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "apiVersion": "v1",
                        "kind": "Status",
                        "metadata": {},
                        "status": "Failure",
                        "message": "etcdserver: request timed out",
                        "reason": "InternalError",
                        "code": 500,
                    }),
                ),
                _ if path.contains("/clusterrolebindings/") => (
                    http::StatusCode::OK,
                    serde_json::to_value(role_binding()).unwrap(),
                ),
                _ if path.contains("/validatingwebhookconfigurations/") => (
                    http::StatusCode::OK,
                    serde_json::to_value(webhook_configuration("kube-system")).unwrap(),
                ),
                _ => (
                    http::StatusCode::OK,
                    json!({
                        "apiVersion": "security.openshift.io/v1",
                        "kind": "SecurityContextConstraints",
                        "metadata": { "name": name },
                    }),
                ),
            };

            let rsp = http::Response::builder()
                .status(status)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(http_body_util::Full::new(Bytes::from(body.to_string())))
                .unwrap();
            futures::future::ready(Ok::<_, Infallible>(rsp))
        });
        (Client::new(service, "default"), requests)
    }

    fn params() -> Params {
        Params {
            namespace: "kube-system".to_string(),
            replicas: 1,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn labels_policies_before_registering_webhooks() {
        let (client, requests) = cluster("none");
        run(client, params()).await.expect("setup must succeed");

        assert_eq!(
            *requests.lock().unwrap(),
            vec![
                "GET /api/v1/namespaces/kube-system/pods",
                "GET /api/v1/namespaces/kube-system/services",
                "GET /apis/security.openshift.io/v1/securitycontextconstraints",
                "PATCH /apis/security.openshift.io/v1/securitycontextconstraints/anyuid",
                "PATCH /apis/security.openshift.io/v1/securitycontextconstraints/restricted",
                "PATCH /apis/admissionregistration.k8s.io/v1/validatingwebhookconfigurations/aro-admission-controller.redhat.com",
                "PATCH /apis/rbac.authorization.k8s.io/v1/clusterrolebindings/aro-admission-controller",
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn label_failures_do_not_abort_setup() {
        let (client, requests) = cluster("anyuid");
        run(client, params()).await.expect("setup must succeed");

        let requests = requests.lock().unwrap();
        assert!(requests.contains(
            &"PATCH /apis/security.openshift.io/v1/securitycontextconstraints/restricted".to_string()
        ));
        assert_eq!(
            requests.last().map(String::as_str),
            Some("PATCH /apis/rbac.authorization.k8s.io/v1/clusterrolebindings/aro-admission-controller")
        );
    }

    #[test]
    fn ownership_label() {
        assert_eq!(
            ownership_patch(),
            json!({ "metadata": { "labels": { OWNERSHIP_LABEL: OWNERSHIP_VALUE } } })
        );
    }

    fn find<'a>(config: &'a ValidatingWebhookConfiguration, name: &str) -> &'a ValidatingWebhook {
        config
            .webhooks
            .iter()
            .flatten()
            .find(|w| w.name == name)
            .unwrap_or_else(|| panic!("missing webhook {name}"))
    }

    #[test]
    fn registers_every_route() {
        let config = webhook_configuration("kube-system");
        assert_eq!(
            config.metadata.name.as_deref(),
            Some("aro-admission-controller.redhat.com")
        );

        let names = config
            .webhooks
            .iter()
            .flatten()
            .map(|w| w.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "pods.aro-admission-controller.redhat.com",
                "daemonsets.aro-admission-controller.redhat.com",
                "replicasets.aro-admission-controller.redhat.com",
                "statefulsets.aro-admission-controller.redhat.com",
                "deployments.aro-admission-controller.redhat.com",
                "jobs.aro-admission-controller.redhat.com",
                "cronjobs.aro-admission-controller.redhat.com",
                "deploymentconfigs.aro-admission-controller.redhat.com",
                "securitycontextconstraints.aro-admission-controller.redhat.com",
            ]
        );

        for webhook in config.webhooks.iter().flatten() {
            assert_eq!(webhook.failure_policy.as_deref(), Some("Fail"));
            assert_eq!(webhook.side_effects, "None");
            let service = webhook.client_config.service.as_ref().expect("service");
            assert_eq!(service.name, "aro-admission-controller");
            assert_eq!(service.namespace, "kube-system");
        }
    }

    #[test]
    fn workload_webhooks() {
        let config = webhook_configuration("kube-system");

        let cronjobs = find(&config, "cronjobs.aro-admission-controller.redhat.com");
        let service = cronjobs.client_config.service.as_ref().expect("service");
        assert_eq!(service.path.as_deref(), Some("/cronjobs"));
        let rule = &cronjobs.rules.as_ref().expect("rules")[0];
        assert_eq!(rule.api_groups, Some(vec!["batch".to_string()]));
        assert_eq!(
            rule.api_versions,
            Some(vec!["v1beta1".to_string(), "v1".to_string()])
        );
        assert_eq!(
            rule.operations,
            Some(vec!["CREATE".to_string(), "UPDATE".to_string()])
        );

        let dcs = find(&config, "deploymentconfigs.aro-admission-controller.redhat.com");
        let rule = &dcs.rules.as_ref().expect("rules")[0];
        assert_eq!(
            rule.api_groups,
            Some(vec!["apps.openshift.io".to_string(), "apps".to_string()])
        );
    }

    #[test]
    fn policy_webhook_reviews_deletes() {
        let config = webhook_configuration("openshift-azure");
        let sccs = find(
            &config,
            "securitycontextconstraints.aro-admission-controller.redhat.com",
        );
        let service = sccs.client_config.service.as_ref().expect("service");
        assert_eq!(service.path.as_deref(), Some("/sccs"));
        assert_eq!(service.namespace, "openshift-azure");

        let rule = &sccs.rules.as_ref().expect("rules")[0];
        assert_eq!(
            rule.api_groups,
            Some(vec!["security.openshift.io".to_string()])
        );
        assert_eq!(rule.api_versions, Some(vec!["v1".to_string()]));
        assert_eq!(
            rule.resources,
            Some(vec!["securitycontextconstraints".to_string()])
        );
        assert_eq!(
            rule.operations,
            Some(vec![
                "CREATE".to_string(),
                "UPDATE".to_string(),
                "DELETE".to_string()
            ])
        );
    }

    #[test]
    fn binds_customer_admins() {
        let crb = role_binding();
        assert_eq!(crb.metadata.name.as_deref(), Some("aro-admission-controller"));
        assert_eq!(crb.role_ref.kind, "ClusterRole");
        assert_eq!(crb.role_ref.name, "privileged-creator");
        let subjects = crb.subjects.expect("subjects");
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].kind, "Group");
        assert_eq!(subjects[0].name, "osa-customer-admins");
    }

    #[test]
    fn readiness() {
        let pod = |status: &str| Pod {
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(is_ready(&pod("True")));
        assert!(!is_ready(&pod("False")));
        assert!(!is_ready(&Pod::default()));
    }
}
