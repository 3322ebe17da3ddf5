//! Configuration management for devrelay.
//!
//! This module defines the structure of the `devrelay.toml` configuration file,
//! loads it, and resolves it into the settings structs each service is built from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

const CONFIG_FILE: &str = "devrelay.toml";

/// Top-level configuration structure corresponding to `devrelay.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Warm-pool settings.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Relay process settings.
    #[serde(default)]
    pub relay: RelayConfig,
    /// Project discovery settings.
    #[serde(default)]
    pub index: IndexConfig,
    /// HTTP fingerprinting settings.
    #[serde(default)]
    pub probe: ProbeConfig,
}

/// `[pool]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolConfig {
    /// Directory holding every pool entry and the pool index.
    pub root: Option<String>,
    /// Scaffold template project cloned into each entry.
    pub template: Option<String>,
    /// Number of unclaimed entries kept warm.
    pub size: Option<usize>,
    /// First port tried for a new entry.
    pub base_port: Option<u16>,
    /// Number of ports scanned upward from `base_port`.
    pub port_range: Option<u16>,
    /// Package manager used for installs and fallback launches.
    pub package_manager: Option<String>,
    /// Scaffold command; `{name}` is replaced with the template directory name.
    pub scaffold: Option<String>,
    /// Upper bound on the post-start readiness wait (milliseconds).
    pub readiness_timeout_ms: Option<u64>,
    /// Upper bound on scaffolding and installing the template (milliseconds).
    pub scaffold_timeout_ms: Option<u64>,
}

/// `[relay]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    /// How long `start` waits for a new listening port (milliseconds).
    pub start_timeout_ms: Option<u64>,
    /// Interval between listener polls (milliseconds).
    pub poll_interval_ms: Option<u64>,
    /// Time between SIGTERM and SIGKILL when stopping (milliseconds).
    pub shutdown_grace_ms: Option<u64>,
}

/// `[index]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexConfig {
    pub max_depth: Option<usize>,
    pub concurrency: Option<usize>,
    pub yield_every: Option<usize>,
}

/// `[probe]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeConfig {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub root: PathBuf,
    pub template: PathBuf,
    pub size: usize,
    pub base_port: u16,
    pub port_range: u16,
    pub package_manager: String,
    pub scaffold: String,
    pub readiness_timeout: Duration,
    pub scaffold_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub start_timeout: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub package_manager: String,
}

#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub max_depth: usize,
    pub concurrency: usize,
    pub yield_every: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub timeout: Duration,
}

/// Fully resolved settings for every service.
#[derive(Debug, Clone)]
pub struct Settings {
    pub pool: PoolSettings,
    pub relay: RelaySettings,
    pub index: IndexSettings,
    pub probe: ProbeSettings,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(3),
            package_manager: "pnpm".to_string(),
        }
    }
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            max_depth: 4,
            concurrency: 16,
            yield_every: 256,
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(800),
        }
    }
}

impl Settings {
    /// Resolves a parsed config against the user's home directory.
    pub fn resolve(config: &Config, home: &Path) -> Result<Self> {
        let pool = &config.pool;
        if pool.base_port == Some(0) {
            bail!("pool.base_port must be between 1 and 65535");
        }
        let package_manager = pool
            .package_manager
            .clone()
            .unwrap_or_else(|| "pnpm".to_string());
        let relay_defaults = RelaySettings::default();
        let index_defaults = IndexSettings::default();
        Ok(Self {
            pool: PoolSettings {
                root: expand_home(pool.root.as_deref().unwrap_or("~/.project-buffer"), home),
                template: expand_home(
                    pool.template
                        .as_deref()
                        .unwrap_or("~/.project-buffer-template"),
                    home,
                ),
                size: pool.size.unwrap_or(2),
                base_port: pool.base_port.unwrap_or(5180),
                port_range: pool.port_range.unwrap_or(200).max(1),
                package_manager: package_manager.clone(),
                scaffold: pool
                    .scaffold
                    .clone()
                    .unwrap_or_else(|| "pnpm create vite@latest {name} --template react-ts".to_string()),
                readiness_timeout: Duration::from_millis(pool.readiness_timeout_ms.unwrap_or(1500)),
                scaffold_timeout: Duration::from_millis(pool.scaffold_timeout_ms.unwrap_or(300_000)),
            },
            relay: RelaySettings {
                start_timeout: config
                    .relay
                    .start_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(relay_defaults.start_timeout),
                poll_interval: config
                    .relay
                    .poll_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(relay_defaults.poll_interval),
                shutdown_grace: config
                    .relay
                    .shutdown_grace_ms
                    .map(Duration::from_millis)
                    .unwrap_or(relay_defaults.shutdown_grace),
                package_manager,
            },
            index: IndexSettings {
                max_depth: config.index.max_depth.unwrap_or(index_defaults.max_depth),
                concurrency: config
                    .index
                    .concurrency
                    .unwrap_or(index_defaults.concurrency)
                    .max(1),
                yield_every: config
                    .index
                    .yield_every
                    .unwrap_or(index_defaults.yield_every)
                    .max(1),
            },
            probe: ProbeSettings {
                timeout: config
                    .probe
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(ProbeSettings::default().timeout),
            },
        })
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Finds the config file to use when `--config` is not given.
pub fn default_config_path() -> Option<PathBuf> {
    let local = Path::new(CONFIG_FILE);
    if local.exists() {
        return Some(local.to_path_buf());
    }
    dirs::config_dir()
        .map(|dir| dir.join("devrelay").join(CONFIG_FILE))
        .filter(|path| path.exists())
}

fn expand_home(raw: &str, home: &Path) -> PathBuf {
    if raw == "~" {
        return home.to_path_buf();
    }
    match raw.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
[pool]
root = "~/buffers"
template = "/opt/template"
size = 3
base_port = 6000
port_range = 10
package_manager = "npm"
readiness_timeout_ms = 250

[relay]
start_timeout_ms = 5000
shutdown_grace_ms = 100

[index]
max_depth = 2

[probe]
timeout_ms = 300
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.pool.size, Some(3));
        assert_eq!(config.pool.base_port, Some(6000));
        assert_eq!(config.relay.start_timeout_ms, Some(5000));
        assert_eq!(config.index.max_depth, Some(2));
        assert_eq!(config.probe.timeout_ms, Some(300));

        let settings = Settings::resolve(&config, Path::new("/home/dev")).unwrap();
        assert_eq!(settings.pool.root, PathBuf::from("/home/dev/buffers"));
        assert_eq!(settings.pool.template, PathBuf::from("/opt/template"));
        assert_eq!(settings.pool.port_range, 10);
        assert_eq!(settings.pool.readiness_timeout, Duration::from_millis(250));
        assert_eq!(settings.relay.package_manager, "npm");
        assert_eq!(settings.relay.shutdown_grace, Duration::from_millis(100));
        assert_eq!(settings.relay.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.index.concurrency, 16);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        let settings = Settings::resolve(&config, Path::new("/home/dev")).unwrap();
        assert_eq!(settings.pool.root, PathBuf::from("/home/dev/.project-buffer"));
        assert_eq!(settings.pool.size, 2);
        assert_eq!(settings.pool.base_port, 5180);
        assert_eq!(settings.pool.package_manager, "pnpm");
        assert_eq!(settings.index.max_depth, 4);
    }

    #[test]
    fn rejects_port_zero_base() {
        let config: Config = toml::from_str("[pool]\nbase_port = 0\n").unwrap();
        let err = Settings::resolve(&config, Path::new("/home/dev")).unwrap_err();
        assert!(err.to_string().contains("base_port"));
    }
}
