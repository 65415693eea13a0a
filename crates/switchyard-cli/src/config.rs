use anyhow::Context;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use switchyard_builtins::BuiltinsConfig;
use switchyard_bus::BusConfig;
use switchyard_registry::RegistryConfig;

pub const DEFAULT_CONFIG_PATH: &str = "switchyard.toml";

/// Contents of `switchyard.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub builtins: BuiltinsConfig,
}

impl AppConfig {
    /// Load the config file at `explicit`, or at [`DEFAULT_CONFIG_PATH`].
    ///
    /// A missing default file yields the built-in defaults; a missing
    /// explicitly named file is an error.
    pub async fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = explicit.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf);

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound && explicit.is_none() => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                ))
            }
        };
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = AppConfig::load(Some(&missing)).await.unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");
        tokio::fs::write(
            &path,
            r#"
            [registry]
            health_check_interval_secs = 5

            [bus]
            subject_prefix = "lab"

            [builtins]
            documentation = false
            "#,
        )
        .await
        .unwrap();

        let config = AppConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.registry.health_check_interval_secs, 5);
        assert_eq!(config.registry.health_check_timeout_secs, 10);
        assert_eq!(config.bus.subject_prefix, "lab");
        assert!(config.bus.persistence_enabled);
        assert!(!config.builtins.documentation);
        assert!(config.builtins.code_analysis);
    }

    #[tokio::test]
    async fn test_invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        tokio::fs::write(&path, "[bus\nurl = ").await.unwrap();
        assert!(AppConfig::load(Some(&path)).await.is_err());
    }

    #[test]
    fn test_empty_file_is_default() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.bus.url, "memory://local");
        assert_eq!(config.builtins.enabled_types().len(), 5);
    }
}
