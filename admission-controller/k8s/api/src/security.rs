//! OpenShift `security.openshift.io/v1` resources.

use k8s_openapi::{
    api::core::v1::SELinuxOptions, apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;

/// Governs the security features a pod may request and the defaults applied
/// to it.
///
/// Unlike most resources, the constraints are declared at the top level of
/// the object rather than under a `spec`. List fields treat an absent value
/// and an empty list identically so that a round trip through the API server
/// does not change the value.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContextConstraints {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default)]
    pub allow_privileged_container: bool,

    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub default_add_capabilities: Vec<String>,

    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub required_drop_capabilities: Vec<String>,

    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub allowed_capabilities: Vec<String>,

    #[serde(default)]
    pub allow_host_dir_volume_plugin: bool,

    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub allowed_flex_volumes: Vec<AllowedFlexVolume>,

    #[serde(default)]
    pub allow_host_network: bool,

    #[serde(default)]
    pub allow_host_ports: bool,

    #[serde(default, rename = "allowHostPID")]
    pub allow_host_pid: bool,

    #[serde(default, rename = "allowHostIPC")]
    pub allow_host_ipc: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_allow_privilege_escalation: Option<bool>,

    /// When unset, privilege escalation is permitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_privilege_escalation: Option<bool>,

    #[serde(default, deserialize_with = "nullable")]
    pub se_linux_context: SeLinuxContextStrategyOptions,

    #[serde(default, deserialize_with = "nullable")]
    pub run_as_user: RunAsUserStrategyOptions,

    #[serde(default, deserialize_with = "nullable")]
    pub supplemental_groups: GroupStrategyOptions,

    #[serde(default, deserialize_with = "nullable")]
    pub fs_group: GroupStrategyOptions,

    #[serde(default)]
    pub read_only_root_filesystem: bool,

    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,

    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,

    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub seccomp_profiles: Vec<String>,

    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub allowed_unsafe_sysctls: Vec<String>,

    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub forbidden_sysctls: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AllowedFlexVolume {
    pub driver: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeLinuxContextStrategyOptions {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<SeLinuxStrategy>,

    #[serde(default, rename = "seLinuxOptions", skip_serializing_if = "Option::is_none")]
    pub se_linux_options: Option<SELinuxOptions>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum SeLinuxStrategy {
    MustRunAs,
    RunAsAny,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAsUserStrategyOptions {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<RunAsUserStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid_range_min: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid_range_max: Option<i64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum RunAsUserStrategy {
    MustRunAs,
    MustRunAsRange,
    MustRunAsNonRoot,
    RunAsAny,
}

/// Shared by the `fsGroup` and `supplementalGroups` strategies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GroupStrategyOptions {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<GroupStrategy>,

    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<IdRange>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum GroupStrategy {
    MustRunAs,
    RunAsAny,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IdRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
}

/// Treats an explicit `null` like an absent field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// === impl SecurityContextConstraints ===

impl kube::Resource for SecurityContextConstraints {
    type DynamicType = ();
    type Scope = kube::core::ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "SecurityContextConstraints".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "security.openshift.io".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        "v1".into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "securitycontextconstraints".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// === impl IdRange ===

impl IdRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::{Resource, ResourceExt};

    const RESTRICTED: &str = r#"
apiVersion: security.openshift.io/v1
kind: SecurityContextConstraints
metadata:
  name: restricted
  labels:
    azure.openshift.io/owned-by-sync-pod: "false"
allowHostDirVolumePlugin: false
allowHostIPC: false
allowHostNetwork: false
allowHostPID: false
allowHostPorts: false
allowPrivilegeEscalation: true
allowPrivilegedContainer: false
allowedCapabilities: null
defaultAddCapabilities: null
fsGroup:
  type: MustRunAs
groups:
- system:authenticated
priority: null
readOnlyRootFilesystem: false
requiredDropCapabilities:
- KILL
- MKNOD
- SETUID
- SETGID
runAsUser:
  type: MustRunAsRange
seLinuxContext:
  type: MustRunAs
supplementalGroups:
  type: RunAsAny
users: []
volumes:
- configMap
- downwardAPI
- emptyDir
- persistentVolumeClaim
- projected
- secret
"#;

    #[test]
    fn parses_restricted() {
        let scc = serde_yaml::from_str::<SecurityContextConstraints>(RESTRICTED)
            .expect("restricted must parse");
        assert_eq!(scc.name_any(), "restricted");
        assert_eq!(
            scc.labels(),
            &maplit::btreemap! {
                "azure.openshift.io/owned-by-sync-pod".to_string() => "false".to_string(),
            }
        );
        assert!(!scc.allow_privileged_container);
        assert!(scc.allowed_capabilities.is_empty());
        assert!(scc.users.is_empty());
        assert_eq!(scc.groups, vec!["system:authenticated".to_string()]);
        assert_eq!(scc.required_drop_capabilities.len(), 4);
        assert_eq!(
            scc.run_as_user.type_,
            Some(RunAsUserStrategy::MustRunAsRange)
        );
        assert_eq!(scc.fs_group.type_, Some(GroupStrategy::MustRunAs));
        assert_eq!(scc.allow_privilege_escalation, Some(true));
    }

    #[test]
    fn null_and_empty_lists_are_equal() {
        let explicit = serde_json::from_value::<SecurityContextConstraints>(serde_json::json!({
            "metadata": { "name": "anyuid" },
            "allowedCapabilities": [],
            "users": [],
        }))
        .unwrap();
        let implicit = serde_json::from_value::<SecurityContextConstraints>(serde_json::json!({
            "metadata": { "name": "anyuid" },
            "allowedCapabilities": null,
        }))
        .unwrap();
        assert_eq!(explicit, implicit);
    }

    #[test]
    fn resource_identity() {
        assert_eq!(
            SecurityContextConstraints::api_version(&()),
            "security.openshift.io/v1"
        );
        assert_eq!(
            SecurityContextConstraints::plural(&()),
            "securitycontextconstraints"
        );
    }
}
