//! The security context constraints a cluster is provisioned with.

use crate::{baseline::Baseline, protect::ProtectedSet, ConfigError};
use aro_admission_controller_k8s_api::{
    security::{
        GroupStrategy, GroupStrategyOptions, IdRange, RunAsUserStrategy, RunAsUserStrategyOptions,
        SeLinuxContextStrategyOptions, SeLinuxStrategy,
    },
    ObjectMeta, SELinuxOptions, SecurityContextConstraints,
};
use std::{fmt, str::FromStr};

/// The policy that workloads are evaluated against.
pub const RESTRICTED: &str = "restricted";

const DEFAULT_UID_START: i64 = 1_000_000_000;
const DEFAULT_UID_SIZE: i64 = 10_000;
const DEFAULT_MCS_LEVEL: &str = "s0:c1,c0";

const DEFAULT_VOLUMES: [&str; 6] = [
    "configMap",
    "downwardAPI",
    "emptyDir",
    "persistentVolumeClaim",
    "projected",
    "secret",
];

const RESTRICTED_DROPS: [&str; 4] = ["KILL", "MKNOD", "SETUID", "SETGID"];

/// The values the platform assigns to a namespace and injects into the
/// `restricted` policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub uids: UidRange,
    pub mcs_level: String,
}

/// A block of UIDs in the `start/size` form used by namespace annotations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UidRange {
    pub start: i64,
    pub size: i64,
}

/// Returns the compiled `restricted` policy for the given allocation.
pub fn restricted(alloc: &Allocation) -> Result<Baseline, ConfigError> {
    compile(restricted_template(), alloc)
}

/// Compiles a policy as it applies within a namespace, filling the UID range,
/// MCS level and group ranges that its strategies leave to the allocation.
///
/// Values the policy sets explicitly are kept.
pub fn compile(
    mut scc: SecurityContextConstraints,
    alloc: &Allocation,
) -> Result<Baseline, ConfigError> {
    let (start, max) = (alloc.uids.start, alloc.uids.max());

    let user = &mut scc.run_as_user;
    if user.type_ == Some(RunAsUserStrategy::MustRunAsRange) {
        user.uid_range_min = user.uid_range_min.or(Some(start));
        user.uid_range_max = user.uid_range_max.or(Some(max));
    }

    let se_linux = &mut scc.se_linux_context;
    if se_linux.type_ == Some(SeLinuxStrategy::MustRunAs) && se_linux.se_linux_options.is_none() {
        se_linux.se_linux_options = Some(SELinuxOptions {
            level: Some(alloc.mcs_level.clone()),
            ..Default::default()
        });
    }

    for groups in [&mut scc.fs_group, &mut scc.supplemental_groups] {
        if groups.type_ == Some(GroupStrategy::MustRunAs) && groups.ranges.is_empty() {
            groups.ranges = vec![IdRange::new(start, max)];
        }
    }

    Baseline::try_from(&scc)
}

/// Returns the set of policies whose definitions may not be changed beyond
/// granting them to more users and groups.
pub fn protected() -> ProtectedSet {
    ProtectedSet::new(policies())
}

/// The provisioned policies, as they exist before any users or groups are
/// granted them by an administrator.
pub fn policies() -> Vec<SecurityContextConstraints> {
    vec![
        anyuid(),
        hostaccess(),
        hostmount_anyuid(),
        hostnetwork(),
        nonroot(),
        privileged(),
        restricted_template(),
    ]
}

// === impl Allocation ===

impl Default for Allocation {
    fn default() -> Self {
        Self {
            uids: UidRange {
                start: DEFAULT_UID_START,
                size: DEFAULT_UID_SIZE,
            },
            mcs_level: DEFAULT_MCS_LEVEL.to_string(),
        }
    }
}

// === impl UidRange ===

impl UidRange {
    /// The last UID in the block.
    pub fn max(&self) -> i64 {
        self.start + self.size - 1
    }
}

impl FromStr for UidRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidUidRange(s.to_string());
        let (start, size) = s.split_once('/').ok_or_else(invalid)?;
        let start = start.trim().parse::<i64>().map_err(|_| invalid())?;
        let size = size.trim().parse::<i64>().map_err(|_| invalid())?;
        if start < 0 || size <= 0 || start.checked_add(size).is_none() {
            return Err(invalid());
        }
        Ok(Self { start, size })
    }
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.start, self.size)
    }
}

// === policies ===

fn base(name: &str) -> SecurityContextConstraints {
    SecurityContextConstraints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        allow_privilege_escalation: Some(true),
        volumes: strings(&DEFAULT_VOLUMES),
        run_as_user: user_strategy(RunAsUserStrategy::RunAsAny),
        se_linux_context: se_linux_strategy(SeLinuxStrategy::MustRunAs),
        fs_group: group_strategy(GroupStrategy::RunAsAny),
        supplemental_groups: group_strategy(GroupStrategy::RunAsAny),
        ..Default::default()
    }
}

fn anyuid() -> SecurityContextConstraints {
    SecurityContextConstraints {
        priority: Some(10),
        required_drop_capabilities: strings(&["MKNOD"]),
        groups: strings(&["system:cluster-admins"]),
        ..base("anyuid")
    }
}

fn hostaccess() -> SecurityContextConstraints {
    SecurityContextConstraints {
        allow_host_dir_volume_plugin: true,
        allow_host_network: true,
        allow_host_ports: true,
        allow_host_pid: true,
        allow_host_ipc: true,
        required_drop_capabilities: strings(&RESTRICTED_DROPS),
        volumes: with_volumes(&["hostPath"]),
        run_as_user: user_strategy(RunAsUserStrategy::MustRunAsRange),
        fs_group: group_strategy(GroupStrategy::MustRunAs),
        ..base("hostaccess")
    }
}

fn hostmount_anyuid() -> SecurityContextConstraints {
    SecurityContextConstraints {
        allow_host_dir_volume_plugin: true,
        required_drop_capabilities: strings(&["MKNOD"]),
        volumes: with_volumes(&["hostPath", "nfs"]),
        users: strings(&["system:serviceaccount:openshift-infra:pv-recycler-controller"]),
        ..base("hostmount-anyuid")
    }
}

fn hostnetwork() -> SecurityContextConstraints {
    SecurityContextConstraints {
        allow_host_network: true,
        allow_host_ports: true,
        required_drop_capabilities: strings(&RESTRICTED_DROPS),
        run_as_user: user_strategy(RunAsUserStrategy::MustRunAsRange),
        fs_group: group_strategy(GroupStrategy::MustRunAs),
        supplemental_groups: group_strategy(GroupStrategy::MustRunAs),
        ..base("hostnetwork")
    }
}

fn nonroot() -> SecurityContextConstraints {
    SecurityContextConstraints {
        required_drop_capabilities: strings(&RESTRICTED_DROPS),
        run_as_user: user_strategy(RunAsUserStrategy::MustRunAsNonRoot),
        ..base("nonroot")
    }
}

pub(crate) fn privileged() -> SecurityContextConstraints {
    SecurityContextConstraints {
        allow_privileged_container: true,
        allowed_capabilities: strings(&["*"]),
        allow_host_dir_volume_plugin: true,
        volumes: strings(&["*"]),
        allow_host_network: true,
        allow_host_ports: true,
        allow_host_pid: true,
        allow_host_ipc: true,
        se_linux_context: se_linux_strategy(SeLinuxStrategy::RunAsAny),
        users: strings(&[
            "system:admin",
            "system:serviceaccount:openshift-infra:build-controller",
        ]),
        groups: strings(&["system:cluster-admins", "system:nodes", "system:masters"]),
        seccomp_profiles: strings(&["*"]),
        allowed_unsafe_sysctls: strings(&["*"]),
        ..base("privileged")
    }
}

pub(crate) fn restricted_template() -> SecurityContextConstraints {
    SecurityContextConstraints {
        required_drop_capabilities: strings(&RESTRICTED_DROPS),
        run_as_user: user_strategy(RunAsUserStrategy::MustRunAsRange),
        fs_group: group_strategy(GroupStrategy::MustRunAs),
        groups: strings(&["system:authenticated"]),
        ..base(RESTRICTED)
    }
}

fn user_strategy(type_: RunAsUserStrategy) -> RunAsUserStrategyOptions {
    RunAsUserStrategyOptions {
        type_: Some(type_),
        ..Default::default()
    }
}

fn se_linux_strategy(type_: SeLinuxStrategy) -> SeLinuxContextStrategyOptions {
    SeLinuxContextStrategyOptions {
        type_: Some(type_),
        se_linux_options: None,
    }
}

fn group_strategy(type_: GroupStrategy) -> GroupStrategyOptions {
    GroupStrategyOptions {
        type_: Some(type_),
        ranges: vec![],
    }
}

fn with_volumes(extra: &[&str]) -> Vec<String> {
    let mut volumes = strings(&DEFAULT_VOLUMES);
    volumes.extend(strings(extra));
    volumes.sort();
    volumes
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{Groups, Range, RunAsUser, SeLinux, Seccomp};
    use aro_admission_controller_k8s_api::ResourceExt;

    #[test]
    fn parses_uid_ranges() {
        assert_eq!(
            "1000/10".parse::<UidRange>().unwrap(),
            UidRange {
                start: 1000,
                size: 10
            }
        );
        assert_eq!("1000/10".parse::<UidRange>().unwrap().max(), 1009);
        assert_eq!(
            UidRange {
                start: 5,
                size: 2
            }
            .to_string(),
            "5/2"
        );
        for invalid in ["", "1000", "1000/", "/10", "a/10", "1000/0", "-1/10"] {
            assert!(
                matches!(
                    invalid.parse::<UidRange>(),
                    Err(ConfigError::InvalidUidRange(_))
                ),
                "{invalid:?} must not parse"
            );
        }
    }

    #[test]
    fn restricted_uses_allocation() {
        let alloc = Allocation {
            uids: "1000/10".parse().unwrap(),
            mcs_level: "s0:c5,c2".to_string(),
        };
        let baseline = restricted(&alloc).expect("restricted must compile");
        assert_eq!(baseline.name, RESTRICTED);
        assert!(!baseline.allow_privileged);
        assert_eq!(
            baseline.run_as_user,
            RunAsUser::MustRunAsRange {
                min: 1000,
                max: 1009
            }
        );
        assert_eq!(
            baseline.fs_group,
            Groups::MustRunAs(vec![Range {
                min: 1000,
                max: 1009
            }])
        );
        assert_eq!(baseline.supplemental_groups, Groups::RunAsAny);
        match baseline.se_linux {
            SeLinux::MustRunAs(ref opts) => assert_eq!(opts.level.as_deref(), Some("s0:c5,c2")),
            ref other => panic!("unexpected SELinux strategy: {other:?}"),
        }
    }

    #[test]
    fn policies_are_unique_and_compile() {
        let policies = policies();
        let mut names = policies.iter().map(|p| p.name_any()).collect::<Vec<_>>();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), policies.len());

        let alloc = Allocation::default();
        let baselines = policies
            .into_iter()
            .map(|policy| {
                let name = policy.name_any();
                let baseline = compile(policy, &alloc)
                    .unwrap_or_else(|e| panic!("{name} must compile: {e}"));
                (name, baseline)
            })
            .collect::<std::collections::BTreeMap<_, _>>();
        assert_eq!(baselines.len(), 7);

        let range = Range {
            min: 1_000_000_000,
            max: 1_000_009_999,
        };
        let hostnetwork = &baselines["hostnetwork"];
        assert_eq!(
            hostnetwork.run_as_user,
            RunAsUser::MustRunAsRange {
                min: range.min,
                max: range.max
            }
        );
        assert_eq!(hostnetwork.fs_group, Groups::MustRunAs(vec![range]));
        assert_eq!(hostnetwork.supplemental_groups, Groups::MustRunAs(vec![range]));
        assert!(hostnetwork.host.network && hostnetwork.host.ports && !hostnetwork.host.pid);

        let hostaccess = &baselines["hostaccess"];
        assert!(hostaccess.volumes.allows("hostPath"));
        assert_eq!(hostaccess.supplemental_groups, Groups::RunAsAny);

        assert_eq!(baselines["nonroot"].run_as_user, RunAsUser::MustRunAsNonRoot);
        assert_eq!(baselines["anyuid"].run_as_user, RunAsUser::RunAsAny);
        for name in ["anyuid", "hostmount-anyuid", "nonroot", RESTRICTED] {
            match baselines[name].se_linux {
                SeLinux::MustRunAs(ref opts) => {
                    assert_eq!(opts.level.as_deref(), Some(DEFAULT_MCS_LEVEL), "{name}")
                }
                ref other => panic!("{name} has unexpected SELinux strategy: {other:?}"),
            }
        }

        let privileged = &baselines["privileged"];
        assert!(privileged.allow_privileged);
        assert_eq!(privileged.se_linux, SeLinux::RunAsAny);
        assert_eq!(privileged.seccomp, Seccomp::Any);
        assert!(privileged.sysctls.allows("kernel.msgmax"));
    }

    #[test]
    fn compile_keeps_explicit_values() {
        let mut scc = restricted_template();
        scc.run_as_user.uid_range_min = Some(2000);
        scc.run_as_user.uid_range_max = Some(2999);
        scc.se_linux_context.se_linux_options = Some(SELinuxOptions {
            level: Some("s0:c9,c3".to_string()),
            ..Default::default()
        });
        let baseline = compile(scc, &Allocation::default()).unwrap();
        assert_eq!(
            baseline.run_as_user,
            RunAsUser::MustRunAsRange {
                min: 2000,
                max: 2999
            }
        );
        match baseline.se_linux {
            SeLinux::MustRunAs(ref opts) => assert_eq!(opts.level.as_deref(), Some("s0:c9,c3")),
            ref other => panic!("unexpected SELinux strategy: {other:?}"),
        }
        assert_eq!(
            baseline.fs_group,
            Groups::MustRunAs(vec![Range {
                min: 1_000_000_000,
                max: 1_000_009_999
            }])
        );
    }

    #[test]
    fn anyuid_matches_provisioned_definition() {
        let anyuid = policies()
            .into_iter()
            .find(|p| p.name_any() == "anyuid")
            .expect("anyuid must exist");
        assert_eq!(anyuid.priority, Some(10));
        assert_eq!(anyuid.required_drop_capabilities, vec!["MKNOD".to_string()]);
        assert_eq!(anyuid.groups, vec!["system:cluster-admins".to_string()]);
        assert!(anyuid.users.is_empty());
        assert_eq!(anyuid.run_as_user.type_, Some(RunAsUserStrategy::RunAsAny));
        assert_eq!(anyuid.allow_privilege_escalation, Some(true));
    }
}
