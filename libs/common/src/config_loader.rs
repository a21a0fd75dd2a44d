//! Configuration loading helper functions
//!
//! Layering, lowest priority first: serialized defaults, an optional config
//! file (format chosen by extension), then prefixed environment variables.

use std::path::Path;

use errors::{CanError, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

/// Build the layered figment for a config type
///
/// Nested keys in the environment use `__` as separator, so
/// `CANBENCH_CHANNEL__BITRATE=250000` sets `channel.bitrate`.
pub fn layered_figment<T: Serialize>(
    defaults: &T,
    path: Option<&Path>,
    env_prefix: &str,
) -> Result<Figment> {
    let mut figment = Figment::from(Serialized::defaults(defaults));

    if let Some(path) = path {
        if !path.exists() {
            return Err(CanError::config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| CanError::config("config file has no extension"))?;

        figment = match extension {
            "json" => figment.merge(Json::file(path)),
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            _ => {
                return Err(CanError::config(format!(
                    "Unsupported config format: {}",
                    extension
                )))
            },
        };
        info!("Config file: {}", path.display());
    }

    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Extract a config value from defaults, file and environment
pub fn load_layered<T>(defaults: &T, path: Option<&Path>, env_prefix: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    layered_figment(defaults, path, env_prefix)?
        .extract()
        .map_err(|e| CanError::config(format!("Failed to parse config: {}", e)))
}
