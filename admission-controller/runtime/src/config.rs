use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// The contents of the whitelist configuration file.
///
/// ```yaml
/// whitelistedImages:
/// - ^registry.access.redhat.com/openshift3/.*$
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistConfig {
    #[serde(default)]
    pub whitelisted_images: Vec<String>,
}

// === impl WhitelistConfig ===

impl WhitelistConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&yaml).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        // An empty document configures no patterns.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }
}
