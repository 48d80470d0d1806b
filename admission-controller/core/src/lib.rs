#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod baseline;
pub mod bootstrap;
pub mod compliance;
pub mod field;
pub mod protect;
mod verdict;
mod whitelist;
pub mod workload;

pub use self::{
    baseline::Baseline,
    field::{Path, Violation},
    protect::ProtectedSet,
    verdict::Verdict,
    whitelist::Whitelist,
    workload::{normalize, Workload, WorkloadKind},
};
use aro_admission_controller_k8s_api::SecurityContextConstraints;

/// Indicates that a workload could not be processed.
///
/// These are distinct from policy violations: the engine was unable to reach a
/// decision.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported kind {group}/{version}/{kind}")]
    UnsupportedKind {
        group: String,
        version: String,
        kind: String,
    },

    #[error("{kind} has no pod spec")]
    MissingTemplate { kind: &'static str },

    #[error("{kind} has no pod template at {pointer}")]
    MissingTemplateAt { kind: String, pointer: String },

    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {kind} pod template: {source}")]
    DecodeTemplate {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Indicates that the engine's configuration is unusable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid whitelist pattern {pattern:?}: {source}")]
    Whitelist {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("SCC {scc} has no {strategy} strategy")]
    MissingStrategy { scc: String, strategy: &'static str },

    #[error("SCC {scc} requires a UID but none is set")]
    MissingUid { scc: String },

    #[error("SCC {scc} requires a UID range but none is set")]
    MissingUidRange { scc: String },

    #[error("SCC {scc} has an invalid {strategy} range: {min}-{max}")]
    InvalidRange {
        scc: String,
        strategy: &'static str,
        min: i64,
        max: i64,
    },

    #[error("SCC {scc} requires SELinux options but none are set")]
    MissingSeLinuxOptions { scc: String },

    #[error("SCC {scc} requires {strategy} ranges but none are set")]
    MissingGroupRanges { scc: String, strategy: &'static str },

    #[error("SCC {scc} disallows privilege escalation but defaults to allowing it")]
    EscalationDefault { scc: String },

    #[error("SCC {scc} has an invalid sysctl pattern {pattern:?}")]
    InvalidSysctlPattern { scc: String, pattern: String },

    #[error("invalid UID range {0:?}; expected <start>/<size>")]
    InvalidUidRange(String),
}

/// Decides whether workloads and policy changes are admitted.
///
/// All state is fixed at construction so that an engine may be shared by
/// concurrent requests.
#[derive(Clone, Debug)]
pub struct Engine {
    whitelist: Whitelist,
    baseline: Baseline,
    protected: ProtectedSet,
}

// === impl Error ===

impl Error {
    /// Unsupported kinds indicate a problem with the engine rather than with
    /// the submitted object.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedKind { .. })
    }
}

// === impl Engine ===

impl Engine {
    pub fn new(whitelist: Whitelist, baseline: Baseline, protected: ProtectedSet) -> Self {
        Self {
            whitelist,
            baseline,
            protected,
        }
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub fn protected(&self) -> &ProtectedSet {
        &self.protected
    }

    pub fn admit_workload(&self, workload: &Workload) -> Verdict {
        if self.whitelist.is_exempt(&workload.spec) {
            tracing::debug!(
                kind = %workload.kind,
                namespace = %workload.namespace,
                name = ?workload.metadata.name,
                "Workload is exempt from policy evaluation"
            );
            return Verdict::allow();
        }

        compliance::evaluate(&workload.spec, &self.baseline, &workload.namespace).into()
    }

    pub fn admit_policy(&self, scc: &SecurityContextConstraints) -> Verdict {
        self.protected.verify(scc).into()
    }

    pub fn admit_policy_deletion(&self, name: &str) -> Verdict {
        self.protected.verify_delete(name).into()
    }
}
