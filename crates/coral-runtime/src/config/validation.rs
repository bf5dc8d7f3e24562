//! Configuration validation.

use std::collections::HashSet;

use super::error::{ConfigError, ConfigResult};
use super::schema::{BusSection, CoralConfig, LoggingConfig, PluginsSection};

/// Validates the entire configuration.
pub fn validate_config(config: &CoralConfig) -> ConfigResult<()> {
    validate_bus(&config.bus)?;
    validate_plugins(&config.plugins)?;
    validate_logging(&config.logging)?;
    Ok(())
}

fn validate_bus(bus: &BusSection) -> ConfigResult<()> {
    if bus.queue_capacity == 0 {
        return Err(ConfigError::validation(
            "bus.queue_capacity must be greater than 0",
        ));
    }
    if bus.batch_size == 0 {
        return Err(ConfigError::validation("bus.batch_size must be greater than 0"));
    }
    if bus.handler_timeout_ms == Some(0) {
        return Err(ConfigError::validation(
            "bus.handler_timeout_ms must be greater than 0 when set",
        ));
    }
    if let Some(prefix) = &bus.command_prefix
        && prefix.trim().is_empty()
    {
        return Err(ConfigError::missing_field("bus.command_prefix"));
    }
    Ok(())
}

fn validate_plugins(plugins: &PluginsSection) -> ConfigResult<()> {
    if plugins.max_concurrency == 0 {
        return Err(ConfigError::validation(
            "plugins.max_concurrency must be greater than 0",
        ));
    }
    if plugins.hook_timeout_ms == Some(0) {
        return Err(ConfigError::validation(
            "plugins.hook_timeout_ms must be greater than 0 when set",
        ));
    }

    let mut seen = HashSet::new();
    for name in &plugins.disabled {
        if name.trim().is_empty() {
            return Err(ConfigError::missing_field("plugins.disabled[]"));
        }
        if !seen.insert(name) {
            return Err(ConfigError::validation(format!(
                "Plugin {name} is listed twice in plugins.disabled"
            )));
        }
    }

    if plugins.config.keys().any(|name| name.trim().is_empty()) {
        return Err(ConfigError::validation(
            "plugins.config contains an empty plugin name",
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.max_files == 0 {
        return Err(ConfigError::validation(
            "logging.max_files must be greater than 0",
        ));
    }
    for module in logging.filters.keys() {
        if module.trim().is_empty() || module.contains(char::is_whitespace) {
            return Err(ConfigError::validation(format!(
                "Invalid logging filter target: {module:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&CoralConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = CoralConfig::default();
        config.bus.queue_capacity = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Validation { .. })
        ));

        let mut config = CoralConfig::default();
        config.plugins.max_concurrency = 0;
        assert!(validate_config(&config).is_err());

        let mut config = CoralConfig::default();
        config.bus.handler_timeout_ms = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_empty_names_rejected() {
        let mut config = CoralConfig::default();
        config.plugins.disabled = vec!["".into()];
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField { .. })
        ));

        let mut config = CoralConfig::default();
        config.bus.command_prefix = Some(" ".into());
        assert!(validate_config(&config).is_err());

        let mut config = CoralConfig::default();
        config.bus.command_prefix = None;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_duplicate_disabled_and_bad_filters() {
        let mut config = CoralConfig::default();
        config.plugins.disabled = vec!["weather".into(), "weather".into()];
        assert!(validate_config(&config).is_err());

        let mut config = CoralConfig::default();
        config
            .logging
            .filters
            .insert("coral framework".into(), LogLevel::Trace);
        assert!(validate_config(&config).is_err());
    }
}
