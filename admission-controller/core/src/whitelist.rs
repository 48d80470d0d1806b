use crate::ConfigError;
use aro_admission_controller_k8s_api::PodSpec;
use regex::{RegexSet, RegexSetBuilder};

const NODE_ROLE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/infra",
];

const NODE_NAME_PREFIXES: [&str; 2] = ["master-", "infra-"];

/// Decides whether a pod template may skip policy evaluation.
///
/// Templates bound to control-plane or infrastructure nodes are exempt, as are
/// templates whose images all match a configured pattern.
#[derive(Clone, Debug)]
pub struct Whitelist {
    patterns: RegexSet,
}

// === impl Whitelist ===

impl Whitelist {
    /// Compiles `patterns` for case-insensitive, full-string matching.
    pub fn new<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut anchored = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            // Validate each pattern on its own so the error names it.
            regex::Regex::new(pattern).map_err(|source| ConfigError::Whitelist {
                pattern: pattern.to_string(),
                source,
            })?;
            anchored.push(format!("^(?:{pattern})$"));
        }

        let patterns = RegexSetBuilder::new(&anchored)
            .case_insensitive(true)
            .build()
            .map_err(|source| ConfigError::Whitelist {
                pattern: anchored.join("|"),
                source,
            })?;
        Ok(Self { patterns })
    }

    pub fn empty() -> Self {
        Self {
            patterns: RegexSet::empty(),
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_exempt(&self, spec: &PodSpec) -> bool {
        if let Some(selector) = spec.node_selector.as_ref() {
            if NODE_ROLE_LABELS
                .iter()
                .any(|label| selector.get(*label).map(String::as_str) == Some("true"))
            {
                tracing::trace!("Exempt by node selector");
                return true;
            }
        }

        if let Some(node) = spec.node_name.as_deref() {
            if NODE_NAME_PREFIXES.iter().any(|p| node.starts_with(p)) {
                tracing::trace!(%node, "Exempt by node name");
                return true;
            }
        }

        spec.containers
            .iter()
            .chain(spec.init_containers.iter().flatten())
            .all(|c| {
                let image = c.image.as_deref().unwrap_or_default();
                self.patterns.is_match(image)
            })
    }
}
