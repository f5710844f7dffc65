//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use voodoo_core::{DEFAULT_HOST, DEFAULT_PORT};

/// Daemon configuration. File: ~/.config/voodoo/config.toml or /etc/voodoo/config.toml.
/// Env overrides: VOODOO_BIND, VOODOO_HOST, VOODOO_PORT.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the server binds (default 0.0.0.0).
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Host the client subcommands connect to (default 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port for both (default 5000).
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Load an explicit file (must exist), then env vars.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let mut c = read(path)?;
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("VOODOO_BIND") {
        c.bind = s;
    }
    if let Some(s) = var("VOODOO_HOST") {
        c.host = s;
    }
    if let Some(s) = var("VOODOO_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => tracing::warn!(value = %s, "ignoring invalid VOODOO_PORT"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/voodoo/config.toml"));
    }
    out.push(PathBuf::from("/etc/voodoo/config.toml"));
    out
}

fn read(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!("{e}; using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("port = 6000").unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.bind, "0.0.0.0");
        assert_eq!(c.host, "127.0.0.1");
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("prot = 1").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        apply_env(&mut c, |key| match key {
            "VOODOO_PORT" => Some("7001".into()),
            "VOODOO_HOST" => Some("10.0.0.2".into()),
            _ => None,
        });
        assert_eq!(c.port, 7001);
        assert_eq!(c.host, "10.0.0.2");
        assert_eq!(c.bind, "0.0.0.0");

        apply_env(&mut c, |key| (key == "VOODOO_PORT").then(|| "not a port".into()));
        assert_eq!(c.port, 7001);
    }
}
