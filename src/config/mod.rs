// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Prefix for environment overrides, e.g. `PROXY_POOL__HEALTH__INTERVAL_SECS=60`.
pub const ENV_PREFIX: &str = "PROXY_POOL";

/// Load configuration from a file (YAML or JSON), then apply environment overrides
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .context("Failed to read config file")?;

    let config: Config = if path.extension().and_then(|s| s.to_str()) == Some("yaml")
        || path.extension().and_then(|s| s.to_str()) == Some("yml") {
        serde_yaml::from_str(&contents).context("Failed to parse YAML config")?
    } else {
        serde_json::from_str(&contents).context("Failed to parse JSON config")?
    };

    let config = apply_env_overrides(config)?;
    config.validate()?;
    Ok(config)
}

/// Layer `PROXY_POOL__*` variables over an already parsed configuration.
pub fn apply_env_overrides(base: Config) -> Result<Config> {
    let layered = config::Config::builder()
        .add_source(config::Config::try_from(&base).context("Failed to stage file config")?)
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to merge environment overrides")?;

    layered
        .try_deserialize()
        .context("Invalid configuration after environment overrides")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_yaml_file() {
        let path = std::env::temp_dir().join(format!("proxy-pool-{}.yaml", uuid::Uuid::new_v4()));
        tokio::fs::write(
            &path,
            "pool:\n  shared_capacity: 3\nproxies:\n  - id: 7\n    host: 10.0.0.7\n    port: 3128\n",
        )
        .await
        .unwrap();

        let config = load_config(&path).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;

        assert_eq!(config.pool.shared_capacity, 3);
        assert_eq!(config.proxies.len(), 1);
        assert_eq!(config.health.condemn_after_failures, 3);
    }

    #[test]
    fn environment_overrides_file_values() {
        let base: Config = serde_yaml::from_str("health:\n  stagger_ms: 5\n").unwrap();

        std::env::set_var("PROXY_POOL__HEALTH__STAGGER_MS", "40");
        let layered = apply_env_overrides(base);
        std::env::remove_var("PROXY_POOL__HEALTH__STAGGER_MS");

        let config = layered.unwrap();
        assert_eq!(config.health.stagger_ms, 40);
        assert_eq!(config.health.max_concurrency, 100);
    }
}
