use crate::field::{self, Violation};

/// The decision for a single admission request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub message: Option<String>,
}

// === impl Verdict ===

impl Verdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            message: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: Some(message.into()),
        }
    }
}

impl From<Vec<Violation>> for Verdict {
    fn from(violations: Vec<Violation>) -> Self {
        if violations.is_empty() {
            return Self::allow();
        }
        Self::deny(field::aggregate(&violations))
    }
}
