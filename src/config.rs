#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_VIEWTUBE_PORT: u16 = 8080;
pub const DEFAULT_VIEWTUBE_HOST: &str = "127.0.0.1";
/// Ten minutes, matching the freshness window the API cache has always used.
pub const DEFAULT_CACHE_DURATION_SECS: u64 = 600;
pub const DEFAULT_SNAPSHOT_PATH: &str = "videos-snapshot.json";

/// Resolved backend configuration.
///
/// `webhook_secret` falls back to `cron_secret` when unset so a deployment
/// with a single shared secret keeps working.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub api_key: String,
    pub playlist_id: String,
    pub cron_secret: String,
    pub webhook_secret: String,
    pub cache_duration: Duration,
    pub snapshot_path: PathBuf,
    pub viewtube_port: u16,
    pub viewtube_host: String,
}

pub fn load_config() -> Result<BackendConfig> {
    resolve_config(ConfigOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub viewtube_port: Option<u16>,
    pub viewtube_host: Option<String>,
    pub snapshot_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<BackendConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<BackendConfig> {
    build_config_with_overrides(file_vars, env_lookup, ConfigOverrides::default())
}

fn build_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<BackendConfig> {
    let api_key = lookup_value("GOOGLE_API_KEY", file_vars, &env_lookup)
        .ok_or_else(|| anyhow!("GOOGLE_API_KEY not set"))?;
    let playlist_id = lookup_value("UPLOADS_PLAYLIST_ID", file_vars, &env_lookup)
        .ok_or_else(|| anyhow!("UPLOADS_PLAYLIST_ID not set"))?;
    let cron_secret = lookup_value("CRON_SECRET", file_vars, &env_lookup)
        .ok_or_else(|| anyhow!("CRON_SECRET not set"))?;
    let webhook_secret = lookup_value("WEBHOOK_SECRET", file_vars, &env_lookup)
        .unwrap_or_else(|| cron_secret.clone());
    let cache_duration_secs = lookup_value("CACHE_DURATION_SECS", file_vars, &env_lookup)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_CACHE_DURATION_SECS);
    let snapshot_path = overrides
        .snapshot_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("SNAPSHOT_PATH", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_SNAPSHOT_PATH.to_string());
    let viewtube_port = overrides
        .viewtube_port
        .or_else(|| {
            lookup_value("VIEWTUBE_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_VIEWTUBE_PORT);
    let viewtube_host = overrides
        .viewtube_host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("VIEWTUBE_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_VIEWTUBE_HOST.to_string());

    Ok(BackendConfig {
        api_key,
        playlist_id,
        cron_secret,
        webhook_secret,
        cache_duration: Duration::from_secs(cache_duration_secs),
        snapshot_path: PathBuf::from(snapshot_path),
        viewtube_port,
        viewtube_host,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
