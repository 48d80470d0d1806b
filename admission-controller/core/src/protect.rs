use crate::field::Violation;
use ahash::AHashMap as HashMap;
use aro_admission_controller_k8s_api::{ObjectMeta, ResourceExt, SecurityContextConstraints};

/// Marks a policy as managed by the cluster rather than by its provisioning
/// sync process.
pub const OWNERSHIP_LABEL: &str = "azure.openshift.io/owned-by-sync-pod";
pub const OWNERSHIP_VALUE: &str = "false";

/// Policies that may only be granted to additional users and groups.
#[derive(Clone, Debug, Default)]
pub struct ProtectedSet {
    templates: HashMap<String, SecurityContextConstraints>,
}

// === impl ProtectedSet ===

impl ProtectedSet {
    pub fn new(templates: impl IntoIterator<Item = SecurityContextConstraints>) -> Self {
        let templates = templates
            .into_iter()
            .map(|scc| (scc.name_any(), scc))
            .collect();
        Self { templates }
    }

    pub fn get(&self, name: &str) -> Option<&SecurityContextConstraints> {
        self.templates.get(name)
    }

    pub fn is_protected(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Checks a create or update of `candidate` against its protected
    /// template, if it has one.
    pub fn verify(&self, candidate: &SecurityContextConstraints) -> Vec<Violation> {
        let name = candidate.name_any();
        match self.templates.get(&name) {
            Some(template) => verify(candidate, template),
            None => {
                tracing::trace!(%name, "Policy is not protected");
                Vec::new()
            }
        }
    }

    pub fn verify_delete(&self, name: &str) -> Vec<Violation> {
        if self.is_protected(name) {
            vec![Violation::denied(format_args!(
                "Deletion of protected SCC {name} is not allowed"
            ))]
        } else {
            Vec::new()
        }
    }
}

/// Checks that `candidate` differs from `template` only by granting the policy
/// to additional users and groups, and that it is labeled as cluster-managed.
///
/// Only the first removed user and the first removed group are reported.
pub fn verify(
    candidate: &SecurityContextConstraints,
    template: &SecurityContextConstraints,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    if let Some(user) = template.users.iter().find(|u| !candidate.users.contains(u)) {
        violations.push(Violation::denied(format_args!(
            "Removal of User {user} from SCC is not allowed"
        )));
    }
    if let Some(group) = template
        .groups
        .iter()
        .find(|g| !candidate.groups.contains(g))
    {
        violations.push(Violation::denied(format_args!(
            "Removal of Group {group} from SCC is not allowed"
        )));
    }

    if without_principals(candidate) != without_principals(template) {
        violations.push(Violation::denied(
            "Modification of fields other than Users and Groups in the SCC is not allowed",
        ));
    }

    let owned = candidate
        .labels()
        .get(OWNERSHIP_LABEL)
        .map(String::as_str);
    if owned != Some(OWNERSHIP_VALUE) {
        violations.push(Violation::denied(format_args!(
            "Label {OWNERSHIP_LABEL} must be set to \"{OWNERSHIP_VALUE}\""
        )));
    }

    violations
}

fn without_principals(scc: &SecurityContextConstraints) -> SecurityContextConstraints {
    SecurityContextConstraints {
        metadata: ObjectMeta::default(),
        users: Vec::new(),
        groups: Vec::new(),
        ..scc.clone()
    }
}
