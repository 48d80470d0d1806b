//! A validated, compiled form of the policy that non-exempt workloads are
//! evaluated against.

use crate::ConfigError;
use ahash::AHashSet as HashSet;
use aro_admission_controller_k8s_api::{
    security::{GroupStrategy, GroupStrategyOptions, IdRange, RunAsUserStrategy, SeLinuxStrategy},
    ResourceExt, SELinuxOptions, SecurityContextConstraints,
};

/// Matches any capability, volume type, seccomp profile or sysctl.
pub const ALL: &str = "*";

/// Sysctls that are namespaced and isolated from the node, so any pod may set
/// them.
pub const SAFE_SYSCTLS: [&str; 3] = [
    "kernel.shm_rmid_forced",
    "net.ipv4.ip_local_port_range",
    "net.ipv4.tcp_syncookies",
];

#[derive(Clone, Debug, PartialEq)]
pub struct Baseline {
    pub name: String,
    pub allow_privileged: bool,
    pub default_add_capabilities: Vec<String>,
    pub required_drop_capabilities: Vec<String>,
    pub allowed_capabilities: Capabilities,
    pub host: HostAccess,
    pub volumes: Volumes,
    pub run_as_user: RunAsUser,
    pub se_linux: SeLinux,
    pub fs_group: Groups,
    pub supplemental_groups: Groups,
    pub escalation: Escalation,
    pub read_only_root_filesystem: bool,
    pub seccomp: Seccomp,
    pub sysctls: Sysctls,
    /// Drivers that flex volumes may use. Empty permits any driver.
    pub flex_volume_drivers: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Capabilities {
    Any,
    Only(HashSet<String>),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HostAccess {
    pub network: bool,
    pub ports: bool,
    pub pid: bool,
    pub ipc: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Volumes {
    Any,
    Only(HashSet<String>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunAsUser {
    RunAsAny,
    MustRunAs(i64),
    MustRunAsRange { min: i64, max: i64 },
    MustRunAsNonRoot,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SeLinux {
    RunAsAny,
    MustRunAs(SELinuxOptions),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Groups {
    RunAsAny,
    MustRunAs(Vec<Range>),
}

/// Seccomp profiles, in the `runtime/default`, `unconfined` or
/// `localhost/<name>` form, that pods and containers may request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seccomp {
    Any,
    /// An empty list forbids setting a profile at all.
    Only(Vec<String>),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sysctls {
    pub allowed_unsafe: Vec<SysctlPattern>,
    pub forbidden: Vec<SysctlPattern>,
}

/// A sysctl name, a trailing-`*` prefix such as `kernel.msg*`, or `*`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SysctlPattern {
    Any,
    Prefix(String),
    Exact(String),
}

/// An inclusive ID range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Range {
    pub min: i64,
    pub max: i64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Escalation {
    pub allowed: bool,
    pub default: Option<bool>,
}

// === impl Baseline ===

impl TryFrom<&SecurityContextConstraints> for Baseline {
    type Error = ConfigError;

    fn try_from(scc: &SecurityContextConstraints) -> Result<Self, Self::Error> {
        let name = scc.name_any();
        let allowed_capabilities = if scc.allowed_capabilities.iter().any(|c| c == ALL) {
            Capabilities::Any
        } else {
            Capabilities::Only(scc.allowed_capabilities.iter().cloned().collect())
        };
        let volumes = if scc.volumes.iter().any(|v| v == ALL) {
            Volumes::Any
        } else {
            Volumes::Only(scc.volumes.iter().cloned().collect())
        };

        let run_as_user = RunAsUser::try_from_scc(&name, scc)?;
        let se_linux = match scc.se_linux_context.type_ {
            None => {
                return Err(ConfigError::MissingStrategy {
                    scc: name,
                    strategy: "seLinuxContext",
                })
            }
            Some(SeLinuxStrategy::RunAsAny) => SeLinux::RunAsAny,
            Some(SeLinuxStrategy::MustRunAs) => {
                let opts = scc
                    .se_linux_context
                    .se_linux_options
                    .clone()
                    .ok_or_else(|| ConfigError::MissingSeLinuxOptions { scc: name.clone() })?;
                SeLinux::MustRunAs(opts)
            }
        };
        let fs_group = Groups::try_from_scc(&name, "fsGroup", &scc.fs_group)?;
        let supplemental_groups =
            Groups::try_from_scc(&name, "supplementalGroups", &scc.supplemental_groups)?;

        let escalation = Escalation {
            allowed: scc.allow_privilege_escalation.unwrap_or(true),
            default: scc.default_allow_privilege_escalation,
        };
        if !escalation.allowed && escalation.default == Some(true) {
            return Err(ConfigError::EscalationDefault { scc: name });
        }

        let seccomp = if scc.seccomp_profiles.iter().any(|p| p == ALL) {
            Seccomp::Any
        } else {
            Seccomp::Only(scc.seccomp_profiles.clone())
        };
        let sysctls = Sysctls {
            allowed_unsafe: SysctlPattern::parse_all(&name, &scc.allowed_unsafe_sysctls)?,
            forbidden: SysctlPattern::parse_all(&name, &scc.forbidden_sysctls)?,
        };

        Ok(Self {
            allow_privileged: scc.allow_privileged_container,
            default_add_capabilities: scc.default_add_capabilities.clone(),
            required_drop_capabilities: scc.required_drop_capabilities.clone(),
            allowed_capabilities,
            host: HostAccess {
                network: scc.allow_host_network,
                ports: scc.allow_host_ports,
                pid: scc.allow_host_pid,
                ipc: scc.allow_host_ipc,
            },
            volumes,
            run_as_user,
            se_linux,
            fs_group,
            supplemental_groups,
            escalation,
            read_only_root_filesystem: scc.read_only_root_filesystem,
            seccomp,
            sysctls,
            flex_volume_drivers: scc
                .allowed_flex_volumes
                .iter()
                .map(|f| f.driver.clone())
                .collect(),
            name,
        })
    }
}

// === impl Capabilities ===

impl Capabilities {
    pub fn allows(&self, cap: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Only(caps) => caps.contains(cap),
        }
    }
}

// === impl Volumes ===

impl Volumes {
    pub fn allows(&self, fs_type: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Only(types) => types.contains(fs_type),
        }
    }
}

impl Baseline {
    /// Whether a flex volume may use `driver`.
    pub fn allows_flex_driver(&self, driver: &str) -> bool {
        self.flex_volume_drivers.is_empty() || self.flex_volume_drivers.iter().any(|d| d == driver)
    }
}

// === impl Seccomp ===

impl Seccomp {
    pub fn allows(&self, profile: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Only(profiles) => profiles.iter().any(|p| p == profile),
        }
    }
}

// === impl Sysctls ===

impl Sysctls {
    pub fn is_forbidden(&self, name: &str) -> bool {
        self.forbidden.iter().any(|p| p.matches(name))
    }

    /// Whether `name` is safe or explicitly allowed despite being unsafe.
    pub fn allows(&self, name: &str) -> bool {
        SAFE_SYSCTLS.contains(&name) || self.allowed_unsafe.iter().any(|p| p.matches(name))
    }
}

// === impl SysctlPattern ===

impl SysctlPattern {
    fn parse(scc: &str, pattern: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidSysctlPattern {
            scc: scc.to_string(),
            pattern: pattern.to_string(),
        };
        if pattern == ALL {
            return Ok(Self::Any);
        }
        let (name, wildcard) = match pattern.strip_suffix('*') {
            Some(prefix) => (prefix, true),
            None => (pattern, false),
        };
        if name.is_empty() || name.contains('*') {
            return Err(invalid());
        }
        if wildcard {
            Ok(Self::Prefix(name.to_string()))
        } else {
            Ok(Self::Exact(name.to_string()))
        }
    }

    fn parse_all(scc: &str, patterns: &[String]) -> Result<Vec<Self>, ConfigError> {
        patterns.iter().map(|p| Self::parse(scc, p)).collect()
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
            Self::Exact(exact) => name == exact,
        }
    }
}

// === impl RunAsUser ===

impl RunAsUser {
    fn try_from_scc(name: &str, scc: &SecurityContextConstraints) -> Result<Self, ConfigError> {
        let opts = &scc.run_as_user;
        match opts.type_ {
            None => Err(ConfigError::MissingStrategy {
                scc: name.to_string(),
                strategy: "runAsUser",
            }),
            Some(RunAsUserStrategy::RunAsAny) => Ok(Self::RunAsAny),
            Some(RunAsUserStrategy::MustRunAsNonRoot) => Ok(Self::MustRunAsNonRoot),
            Some(RunAsUserStrategy::MustRunAs) => {
                let uid = opts.uid.ok_or_else(|| ConfigError::MissingUid {
                    scc: name.to_string(),
                })?;
                Ok(Self::MustRunAs(uid))
            }
            Some(RunAsUserStrategy::MustRunAsRange) => {
                let (min, max) = match (opts.uid_range_min, opts.uid_range_max) {
                    (Some(min), Some(max)) => (min, max),
                    _ => {
                        return Err(ConfigError::MissingUidRange {
                            scc: name.to_string(),
                        })
                    }
                };
                let Range { min, max } = Range::new(name, "runAsUser", min, max)?;
                Ok(Self::MustRunAsRange { min, max })
            }
        }
    }

    /// The UID assigned to containers that do not request one.
    pub fn default_uid(&self) -> Option<i64> {
        match *self {
            Self::MustRunAs(uid) => Some(uid),
            Self::MustRunAsRange { min, .. } => Some(min),
            Self::RunAsAny | Self::MustRunAsNonRoot => None,
        }
    }
}

// === impl Groups ===

impl Groups {
    fn try_from_scc(
        name: &str,
        strategy: &'static str,
        opts: &GroupStrategyOptions,
    ) -> Result<Self, ConfigError> {
        match opts.type_ {
            None => Err(ConfigError::MissingStrategy {
                scc: name.to_string(),
                strategy,
            }),
            Some(GroupStrategy::RunAsAny) => Ok(Self::RunAsAny),
            Some(GroupStrategy::MustRunAs) => {
                if opts.ranges.is_empty() {
                    return Err(ConfigError::MissingGroupRanges {
                        scc: name.to_string(),
                        strategy,
                    });
                }
                let ranges = opts
                    .ranges
                    .iter()
                    .map(|IdRange { min, max }| match (min, max) {
                        (Some(min), Some(max)) => Range::new(name, strategy, *min, *max),
                        _ => Err(ConfigError::MissingGroupRanges {
                            scc: name.to_string(),
                            strategy,
                        }),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::MustRunAs(ranges))
            }
        }
    }

    pub fn allows(&self, id: i64) -> bool {
        match self {
            Self::RunAsAny => true,
            Self::MustRunAs(ranges) => ranges.iter().any(|r| r.contains(id)),
        }
    }

    /// The group assigned to pods that do not request one.
    pub fn default_id(&self) -> Option<i64> {
        match self {
            Self::RunAsAny => None,
            Self::MustRunAs(ranges) => ranges.first().map(|r| r.min),
        }
    }
}

// === impl Range ===

impl Range {
    fn new(scc: &str, strategy: &'static str, min: i64, max: i64) -> Result<Self, ConfigError> {
        if min < 0 || max < min {
            return Err(ConfigError::InvalidRange {
                scc: scc.to_string(),
                strategy,
                min,
                max,
            });
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, id: i64) -> bool {
        self.min <= id && id <= self.max
    }
}
