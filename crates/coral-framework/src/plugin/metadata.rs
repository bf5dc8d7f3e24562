//! Plugin declarations.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PluginError, PluginResult};

// ─── API versioning ─────────────────────────────────────────────────────────

/// Current Coral plugin API version (1.0).
///
/// The high 16 bits are the major part, the low 16 bits the minor part.
pub const PLUGIN_API_VERSION: u32 = 0x0001_0000;

/// Renders a packed API version as `major.minor`.
pub fn format_api_version(version: u32) -> String {
    format!("{}.{}", version >> 16, version & 0xFFFF)
}

// ─── PluginMetadata ─────────────────────────────────────────────────────────

/// Everything a plugin declares about itself.
///
/// # Declaration format
///
/// ```json
/// {
///   "name": "weather",
///   "version": "1.2.0",
///   "author": "someone",
///   "description": "Weather lookups",
///   "compatibility": 65536,
///   "dependencies": ["http"],
///   "permissions": { "weather.query": "Look up the forecast" },
///   "config": { "units": "metric" }
/// }
/// ```
///
/// `name`, `version`, `author`, `description` and `compatibility` are
/// required; the rest default to empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    /// Plugin API version this plugin was written against.
    pub compatibility: u32,
    /// Names of plugins that must be loaded first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// External requirements, informational only.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Permission names this plugin checks, with a human description.
    #[serde(default)]
    pub permissions: BTreeMap<String, String>,
    /// Default configuration, overlaid by the host's per-plugin section.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".into(),
            author: "Unknown".into(),
            description: String::new(),
            compatibility: PLUGIN_API_VERSION,
            dependencies: Vec::new(),
            requirements: Vec::new(),
            permissions: BTreeMap::new(),
            config: Map::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn compatibility(mut self, compatibility: u32) -> Self {
        self.compatibility = compatibility;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn requires(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    pub fn permission(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.permissions.insert(name.into(), description.into());
        self
    }

    pub fn config_default(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Parses a JSON declaration and validates it.
    pub fn from_json(json: &str) -> PluginResult<Self> {
        let metadata: Self = serde_json::from_str(json)
            .map_err(|e| PluginError::invalid_metadata("<declaration>", e.to_string()))?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Returns `true` if this plugin can run against the current API.
    ///
    /// The major part must match exactly; the plugin's minor part must be
    /// ≤ the loader's minor part.
    pub fn is_compatible(&self) -> bool {
        let host_major = PLUGIN_API_VERSION >> 16;
        let host_minor = PLUGIN_API_VERSION & 0xFFFF;
        let major = self.compatibility >> 16;
        let minor = self.compatibility & 0xFFFF;
        major == host_major && minor <= host_minor
    }

    /// Rejects an empty name, a self-dependency and repeated dependencies.
    pub fn validate(&self) -> PluginResult<()> {
        if self.name.trim().is_empty() {
            return Err(PluginError::invalid_metadata(&self.name, "name is empty"));
        }
        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep == &self.name {
                return Err(PluginError::invalid_metadata(&self.name, "plugin depends on itself"));
            }
            if !seen.insert(dep.as_str()) {
                return Err(PluginError::invalid_metadata(
                    &self.name,
                    format!("dependency '{dep}' is listed twice"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let meta = PluginMetadata::new("echo");
        assert_eq!(meta.version, "1.0.0");
        assert_eq!(meta.author, "Unknown");
        assert!(meta.is_compatible());
    }

    #[test]
    fn test_compatibility() {
        assert!(PluginMetadata::new("a").compatibility(0x0001_0000).is_compatible());
        assert!(!PluginMetadata::new("a").compatibility(0x0001_0001).is_compatible());
        assert!(!PluginMetadata::new("a").compatibility(0x0002_0000).is_compatible());
        assert!(!PluginMetadata::new("a").compatibility(0).is_compatible());
        assert_eq!(format_api_version(PLUGIN_API_VERSION), "1.0");
    }

    #[test]
    fn test_from_json_requires_core_fields() {
        let ok = PluginMetadata::from_json(
            r#"{"name":"w","version":"0.1.0","author":"me","description":"d","compatibility":65536,
                "dependencies":["http"],"config":{"units":"metric"}}"#,
        )
        .unwrap();
        assert_eq!(ok.dependencies, vec!["http"]);
        assert_eq!(ok.config["units"], "metric");

        let missing = PluginMetadata::from_json(r#"{"name":"w","version":"0.1.0"}"#);
        assert!(matches!(missing, Err(PluginError::InvalidMetadata { .. })));
    }

    #[test]
    fn test_validate() {
        assert!(PluginMetadata::new(" ").validate().is_err());
        assert!(PluginMetadata::new("a").depends_on("a").validate().is_err());
        assert!(PluginMetadata::new("a").depends_on("b").depends_on("b").validate().is_err());
        assert!(PluginMetadata::new("a").depends_on("b").validate().is_ok());
    }
}
