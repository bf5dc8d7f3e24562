//! Layered configuration loading on top of figment.
//!
//! # Sources (lowest to highest priority)
//!
//! 1. Built-in defaults for the active profile
//! 2. Programmatic overrides passed to [`ConfigLoader::merge`]
//! 3. Profile-specific file (`coral.{profile}.toml` / `coral.{profile}.yaml`)
//! 4. Main file (`coral.toml` / `coral.yaml`)
//! 5. Environment variables (`CORAL_*`)
//!
//! File formats are gated by the `toml-config` and `yaml-config` features;
//! with both enabled, both are searched.
//!
//! # Environment variables
//!
//! The `CORAL_` prefix is stripped and `__` separates nesting levels:
//!
//! - `CORAL_LOGGING__LEVEL=debug` → `logging.level = "debug"`
//! - `CORAL_BUS__QUEUE_CAPACITY=64` → `bus.queue_capacity = 64`
//! - `CORAL_PLUGINS__CONFIG__ECHO__PREFIX=">"` → `plugins.config.echo.prefix = ">"`
//!
//! `CORAL_PROFILE` selects the profile.
//!
//! ```rust,ignore
//! let config = ConfigLoader::new()
//!     .profile("production")
//!     .file("./deploy/coral.toml")
//!     .load()?;
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, trace, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::CoralConfig;
use super::validation::validate_config;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CORAL_";

/// Configuration profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Reads `CORAL_PROFILE`, defaulting to development.
    pub fn from_env() -> Self {
        std::env::var("CORAL_PROFILE")
            .map(|p| Self::parse(&p))
            .unwrap_or_default()
    }

    fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "development" | "dev" => Self::Development,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder over the figment sources.
pub struct ConfigLoader {
    overrides: Figment,
    profile: Profile,
    search_paths: Vec<PathBuf>,
    load_env: bool,
    config_file: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            overrides: Figment::new(),
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            load_env: true,
            config_file: None,
        }
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.profile = Profile::parse(profile.as_ref());
        self
    }

    pub fn active_profile(&self) -> &Profile {
        &self.profile
    }

    /// Adds a directory to search. Without any, the current directory and
    /// the user config directory (`~/.config/coral`) are searched.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(cwd) => self.search_path(cwd),
            Err(_) => self,
        }
    }

    pub fn with_user_config_dir(self) -> Self {
        match dirs::config_dir() {
            Some(dir) => self.search_path(dir.join("coral")),
            None => self,
        }
    }

    /// Loads exactly this file instead of searching. A missing file is an error.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Layers a whole configuration over the defaults; files and environment still win.
    pub fn merge(mut self, config: CoralConfig) -> Self {
        self.overrides = self.overrides.merge(Serialized::defaults(config));
        self
    }

    /// Loads, extracts and validates the configuration.
    pub fn load(self) -> ConfigResult<CoralConfig> {
        let profile = self.profile.clone();
        let config: CoralConfig = self.build_figment()?.extract()?;
        validate_config(&config)?;

        debug!(
            profile = %profile,
            logging_level = %config.logging.level,
            queue_capacity = config.bus.queue_capacity,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn build_figment(mut self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(CoralConfig::for_profile(
            &self.profile,
        )));
        figment = figment.merge(std::mem::take(&mut self.overrides));

        match self.config_file.take() {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading configuration file");
                figment = Self::merge_config_file(figment, &path)?;
            }
            Some(path) => return Err(ConfigError::FileNotFound(path)),
            None => figment = self.load_config_files(figment),
        }

        if self.load_env {
            trace!(prefix = ENV_PREFIX, "Loading environment variables");
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }
        Ok(figment)
    }

    fn merge_config_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            #[cfg(feature = "toml-config")]
            "toml" => Ok(figment.merge(Toml::file(path))),
            #[cfg(feature = "yaml-config")]
            "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
            _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
        }
    }

    fn resolve_search_paths(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }
        let mut paths = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd);
        }
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("coral"));
        }
        paths
    }

    /// Tries `stem.{profile}.ext` then `stem.ext` in every search path; stops
    /// at the first base file found.
    #[cfg(any(feature = "toml-config", feature = "yaml-config"))]
    fn load_format_files<F>(
        &self,
        mut figment: Figment,
        search_paths: &[PathBuf],
        extensions: &[&str],
        merge_fn: F,
    ) -> (Figment, bool)
    where
        F: Fn(Figment, &Path) -> Figment,
    {
        for dir in search_paths {
            for ext in extensions {
                let profile_path = dir.join(format!("coral.{}.{ext}", self.profile));
                if profile_path.exists() {
                    debug!(path = %profile_path.display(), "Loading profile-specific config");
                    figment = merge_fn(figment, &profile_path);
                }

                let base_path = dir.join(format!("coral.{ext}"));
                if base_path.exists() {
                    info!(path = %base_path.display(), "Loading configuration file");
                    return (merge_fn(figment, &base_path), true);
                }
            }
        }
        (figment, false)
    }

    #[allow(unused_mut, unused_variables)]
    fn load_config_files(&self, mut figment: Figment) -> Figment {
        let search_paths = self.resolve_search_paths();
        let mut found = false;

        #[cfg(feature = "toml-config")]
        {
            let (f, ok) = self.load_format_files(figment, &search_paths, &["toml"], |fig, p| {
                fig.merge(Toml::file(p))
            });
            figment = f;
            found |= ok;
        }

        #[cfg(feature = "yaml-config")]
        {
            let (f, ok) =
                self.load_format_files(figment, &search_paths, &["yaml", "yml"], |fig, p| {
                    fig.merge(Yaml::file(p))
                });
            figment = f;
            found |= ok;
        }

        if !found {
            warn!("No configuration file found, using defaults");
        }
        figment
    }
}

/// Loads from the default locations with environment overrides.
pub fn load_config() -> ConfigResult<CoralConfig> {
    ConfigLoader::new().load()
}

/// Loads one specific file with environment overrides.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<CoralConfig> {
    ConfigLoader::new().file(path).load()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use coral_framework::QueuePolicy;
    use figment::Jail;

    #[test]
    fn test_defaults_per_profile() {
        Jail::expect_with(|jail| {
            let dir = jail.directory().to_path_buf();

            let config = ConfigLoader::new()
                .profile("production")
                .search_path(&dir)
                .without_env()
                .load()
                .map_err(|e| e.to_string())?;
            assert_eq!(config.logging.level, LogLevel::Info);
            assert_eq!(config.bus.queue_capacity, 1000);

            let config = ConfigLoader::new()
                .profile("dev")
                .search_path(&dir)
                .without_env()
                .load()
                .map_err(|e| e.to_string())?;
            assert_eq!(config.logging.level, LogLevel::Debug);
            Ok(())
        });
    }

    #[test]
    fn test_profile_from_env() {
        Jail::expect_with(|jail| {
            jail.set_env("CORAL_PROFILE", "prod");
            assert_eq!(Profile::from_env(), Profile::Production);
            jail.set_env("CORAL_PROFILE", "staging");
            assert_eq!(Profile::from_env(), Profile::Custom("staging".into()));
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_nested_keys() {
        Jail::expect_with(|jail| {
            jail.set_env("CORAL_BUS__QUEUE_CAPACITY", "64");
            jail.set_env("CORAL_BUS__QUEUE_POLICY", "drop_newest");
            jail.set_env("CORAL_PLUGINS__MAX_CONCURRENCY", "2");
            jail.set_env("CORAL_PLUGINS__CONFIG__ECHO__PREFIX", ">");

            let config = ConfigLoader::new()
                .search_path(jail.directory())
                .load()
                .map_err(|e| e.to_string())?;
            assert_eq!(config.bus.queue_capacity, 64);
            assert_eq!(config.bus.queue_policy, QueuePolicy::DropNewest);
            assert_eq!(config.plugins.max_concurrency, 2);
            assert_eq!(config.plugins.config["echo"]["prefix"], ">");
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = ConfigLoader::new()
            .file("/definitely/not/here/coral.toml")
            .without_env()
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("CORAL_PLUGINS__MAX_CONCURRENCY", "0");
            let err = ConfigLoader::new()
                .search_path(jail.directory())
                .load()
                .unwrap_err();
            assert!(matches!(err, ConfigError::Validation { .. }));
            Ok(())
        });
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "coral.toml",
                r#"
                    [bus]
                    queue_capacity = 32
                    batch_size = 4

                    [plugins]
                    disabled = ["weather"]

                    [plugins.config.echo]
                    prefix = "[bot]"
                "#,
            )?;
            jail.create_file("coral.production.toml", "[bus]\nbatch_size = 2\n")?;
            jail.set_env("CORAL_BUS__QUEUE_CAPACITY", "128");

            let config = ConfigLoader::new()
                .profile("production")
                .search_path(jail.directory())
                .load()
                .map_err(|e| e.to_string())?;
            assert_eq!(config.bus.queue_capacity, 128);
            // the main file wins over the profile file
            assert_eq!(config.bus.batch_size, 4);
            assert_eq!(config.plugins.disabled, vec!["weather".to_string()]);
            assert_eq!(config.plugins.config["echo"]["prefix"], "[bot]");
            Ok(())
        });
    }
}
