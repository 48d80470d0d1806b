//! Normalizes workload-bearing resources into a single pod template shape.

use crate::Error;
use aro_admission_controller_k8s_api::{
    DynamicObject, GroupVersionKind, ObjectMeta, PodSpec, PodTemplateSpec,
};

/// A pod template extracted from a workload, along with the metadata that
/// accompanies it.
///
/// The template is an independent copy of the submitted object.
#[derive(Clone, Debug, PartialEq)]
pub struct Workload {
    pub kind: &'static str,
    pub spec: PodSpec,
    pub metadata: ObjectMeta,
    pub namespace: String,
}

/// Describes where a workload kind keeps its pod template.
#[derive(Debug)]
pub struct WorkloadKind {
    pub kind: &'static str,
    pub groups: &'static [&'static str],
    pub versions: &'static [&'static str],
    pub resource: &'static str,
    /// The webhook path that serves this kind.
    pub path: &'static str,
    template: fn(&DynamicObject) -> Result<PodTemplateSpec, Error>,
}

/// Every workload kind the engine is able to evaluate.
///
/// New kinds are supported by adding an entry here.
pub static WORKLOAD_KINDS: [WorkloadKind; 8] = [
    WorkloadKind {
        kind: "Pod",
        groups: &[""],
        versions: &["v1"],
        resource: "pods",
        path: "/pods",
        template: pod,
    },
    WorkloadKind {
        kind: "DaemonSet",
        groups: &["apps"],
        versions: &["v1"],
        resource: "daemonsets",
        path: "/daemonsets",
        template: spec_template,
    },
    WorkloadKind {
        kind: "ReplicaSet",
        groups: &["apps"],
        versions: &["v1"],
        resource: "replicasets",
        path: "/replicasets",
        template: spec_template,
    },
    WorkloadKind {
        kind: "StatefulSet",
        groups: &["apps"],
        versions: &["v1"],
        resource: "statefulsets",
        path: "/statefulsets",
        template: spec_template,
    },
    WorkloadKind {
        kind: "Deployment",
        groups: &["apps"],
        versions: &["v1"],
        resource: "deployments",
        path: "/deployments",
        template: spec_template,
    },
    WorkloadKind {
        kind: "Job",
        groups: &["batch"],
        versions: &["v1"],
        resource: "jobs",
        path: "/jobs",
        template: spec_template,
    },
    WorkloadKind {
        kind: "CronJob",
        groups: &["batch"],
        versions: &["v1beta1", "v1"],
        resource: "cronjobs",
        path: "/cronjobs",
        template: job_template,
    },
    WorkloadKind {
        kind: "DeploymentConfig",
        groups: &["apps.openshift.io", "apps"],
        versions: &["v1"],
        resource: "deploymentconfigs",
        path: "/deploymentconfigs",
        template: spec_template,
    },
];

/// Extracts the pod template of `obj`, which was declared to be of kind `gvk`.
///
/// `namespace` is used when the object itself does not carry a namespace, as
/// is the case for objects that are being created.
pub fn normalize(
    gvk: &GroupVersionKind,
    obj: &DynamicObject,
    namespace: Option<&str>,
) -> Result<Workload, Error> {
    let kind = WorkloadKind::lookup(gvk).ok_or_else(|| Error::UnsupportedKind {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        kind: gvk.kind.clone(),
    })?;

    let PodTemplateSpec { metadata, spec } = (kind.template)(obj)?;
    let spec = spec.ok_or(Error::MissingTemplate { kind: kind.kind })?;
    let namespace = obj
        .metadata
        .namespace
        .as_deref()
        .or(namespace)
        .unwrap_or_default()
        .to_string();

    Ok(Workload {
        kind: kind.kind,
        spec,
        metadata: metadata.unwrap_or_default(),
        namespace,
    })
}

// === impl WorkloadKind ===

impl WorkloadKind {
    pub fn lookup(gvk: &GroupVersionKind) -> Option<&'static Self> {
        WORKLOAD_KINDS.iter().find(|k| k.matches_kind(gvk))
    }

    pub fn by_path(path: &str) -> Option<&'static Self> {
        WORKLOAD_KINDS.iter().find(|k| k.path == path)
    }

    pub fn matches_kind(&self, gvk: &GroupVersionKind) -> bool {
        self.kind == gvk.kind
            && self.groups.contains(&gvk.group.as_str())
            && self.versions.contains(&gvk.version.as_str())
    }

    pub fn matches_resource(&self, group: &str, version: &str, resource: &str) -> bool {
        self.resource == resource
            && self.groups.contains(&group)
            && self.versions.contains(&version)
    }
}

/// Pods are their own template.
fn pod(obj: &DynamicObject) -> Result<PodTemplateSpec, Error> {
    let spec = obj
        .data
        .get("spec")
        .cloned()
        .ok_or(Error::MissingTemplate { kind: "Pod" })?;
    let spec = serde_json::from_value(spec).map_err(|source| Error::Decode {
        kind: "Pod",
        source,
    })?;
    Ok(PodTemplateSpec {
        metadata: Some(obj.metadata.clone()),
        spec: Some(spec),
    })
}

fn spec_template(obj: &DynamicObject) -> Result<PodTemplateSpec, Error> {
    template_at(obj, "/spec/template")
}

fn job_template(obj: &DynamicObject) -> Result<PodTemplateSpec, Error> {
    template_at(obj, "/spec/jobTemplate/spec/template")
}

fn template_at(obj: &DynamicObject, pointer: &str) -> Result<PodTemplateSpec, Error> {
    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_else(|| "object".to_string());
    let template = obj
        .data
        .pointer(pointer)
        .cloned()
        .ok_or_else(|| Error::MissingTemplateAt {
            kind: kind.clone(),
            pointer: pointer.to_string(),
        })?;
    serde_json::from_value(template).map_err(|source| Error::DecodeTemplate { kind, source })
}
