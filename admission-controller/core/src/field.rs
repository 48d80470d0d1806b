use serde_json::Value;
use std::fmt;

/// Identifies a field of a resource, e.g. `spec.containers[0].securityContext`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Path(String);

/// A single field-scoped finding that prevents a resource from being admitted.
///
/// Violations without a field path describe the resource as a whole.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    field: Option<Path>,
    message: String,
}

// === impl Path ===

impl Path {
    pub fn new(root: &str) -> Self {
        Self(root.to_string())
    }

    pub fn child(&self, name: &str) -> Self {
        Self(format!("{}.{}", self.0, name))
    }

    pub fn index(&self, idx: usize) -> Self {
        Self(format!("{}[{}]", self.0, idx))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl Violation ===

impl Violation {
    /// The field holds a value that is not permitted.
    pub fn invalid(field: Path, value: impl Into<Value>, detail: impl fmt::Display) -> Self {
        Self {
            field: Some(field),
            message: format!("Invalid value: {}: {}", value.into(), detail),
        }
    }

    /// The field must be set but is not.
    pub fn required(field: Path, detail: impl fmt::Display) -> Self {
        let detail = detail.to_string();
        let message = if detail.is_empty() {
            "Required value".to_string()
        } else {
            format!("Required value: {detail}")
        };
        Self {
            field: Some(field),
            message,
        }
    }

    pub fn forbidden(field: Path, detail: impl fmt::Display) -> Self {
        Self {
            field: Some(field),
            message: format!("Forbidden: {detail}"),
        }
    }

    /// A finding about the resource as a whole.
    pub fn denied(message: impl fmt::Display) -> Self {
        Self {
            field: None,
            message: message.to_string(),
        }
    }

    pub fn field_path(&self) -> Option<&str> {
        self.field.as_ref().map(Path::as_str)
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.field {
            Some(ref field) => write!(f, "{}: {}", field, self.message),
            None => self.message.fmt(f),
        }
    }
}

/// Renders violations as a single message.
///
/// A lone violation renders as itself; several are bracketed and joined in
/// order. Duplicates are kept.
pub fn aggregate(violations: &[Violation]) -> String {
    match violations {
        [] => String::new(),
        [v] => v.to_string(),
        vs => {
            let msgs = vs.iter().map(ToString::to_string).collect::<Vec<_>>();
            format!("[{}]", msgs.join(", "))
        }
    }
}
