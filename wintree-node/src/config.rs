//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::node::NodeSettings;

/// Daemon configuration. File: ~/.config/wintree/config.toml or /etc/wintree/config.toml.
/// Env overrides: WINTREE_WINDOW_ID, WINTREE_CLUSTER, WINTREE_LISTEN_PORT, WINTREE_MAX_CHILDREN,
/// WINTREE_HEARTBEAT_MS, WINTREE_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Numeric window id shown to users (default 0).
    #[serde(default)]
    pub window_id: i32,
    /// Cluster label (default: $HOSTNAME, else "localhost").
    #[serde(default = "default_cluster")]
    pub cluster: String,
    /// TCP port to accept children and parents on. None: connect only.
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// host:port peers to join at startup.
    #[serde(default)]
    pub connect: Vec<String>,
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    /// Keep-alive period; 0 disables the heartbeat.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cluster() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
fn default_max_children() -> usize {
    wintree_core::DEFAULT_MAX_CHILDREN
}
fn default_heartbeat_interval_ms() -> u64 {
    1_000_000
}
fn default_read_timeout_ms() -> u64 {
    60_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_id: 0,
            cluster: default_cluster(),
            listen_port: None,
            connect: Vec::new(),
            max_children: default_max_children(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            window_id: self.window_id,
            cluster: self.cluster.clone(),
            max_children: self.max_children,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

/// Apply overrides from `lookup` (the process environment in production). Unparseable values are ignored.
pub fn apply_env(mut c: Config, lookup: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(v) = lookup("WINTREE_WINDOW_ID").and_then(|s| s.parse().ok()) {
        c.window_id = v;
    }
    if let Some(v) = lookup("WINTREE_CLUSTER").filter(|s| !s.is_empty()) {
        c.cluster = v;
    }
    if let Some(v) = lookup("WINTREE_LISTEN_PORT").and_then(|s| s.parse().ok()) {
        c.listen_port = Some(v);
    }
    if let Some(v) = lookup("WINTREE_MAX_CHILDREN").and_then(|s| s.parse().ok()) {
        c.max_children = v;
    }
    if let Some(v) = lookup("WINTREE_HEARTBEAT_MS").and_then(|s| s.parse().ok()) {
        c.heartbeat_interval_ms = v;
    }
    if let Some(v) = lookup("WINTREE_LOG").filter(|s| !s.is_empty()) {
        c.log_level = v;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/wintree/config.toml"));
    }
    out.push(PathBuf::from("/etc/wintree/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    load_from(&path)
}

/// Parse one config file. None if unreadable or invalid (the caller falls back to defaults).
pub fn load_from(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn file_values_and_defaults() {
        let f = write_config(
            r#"
window_id = 7
cluster = "lab"
listen_port = 9000
connect = ["10.0.0.2:9000"]
"#,
        );
        let c = load_from(f.path()).unwrap();
        assert_eq!(c.window_id, 7);
        assert_eq!(c.cluster, "lab");
        assert_eq!(c.listen_port, Some(9000));
        assert_eq!(c.connect, vec!["10.0.0.2:9000".to_string()]);
        assert_eq!(c.max_children, wintree_core::DEFAULT_MAX_CHILDREN);
        assert_eq!(c.heartbeat_interval_ms, 1_000_000);
        assert_eq!(c.read_timeout_ms, 60_000);
        assert_eq!(c.log_level, "info");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let f = write_config("window_id = 1\nproxy_port = 3128\n");
        assert!(load_from(f.path()).is_none());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_from(&dir.path().join("absent.toml")).is_none());
    }

    #[test]
    fn env_overrides_file() {
        let vars: HashMap<&str, &str> = [
            ("WINTREE_WINDOW_ID", "3"),
            ("WINTREE_CLUSTER", "edge"),
            ("WINTREE_LISTEN_PORT", "9100"),
            ("WINTREE_MAX_CHILDREN", "not-a-number"),
            ("WINTREE_HEARTBEAT_MS", "0"),
            ("WINTREE_LOG", "debug"),
        ]
        .into_iter()
        .collect();
        let c = apply_env(Config::default(), |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.window_id, 3);
        assert_eq!(c.cluster, "edge");
        assert_eq!(c.listen_port, Some(9100));
        assert_eq!(c.max_children, wintree_core::DEFAULT_MAX_CHILDREN);
        assert_eq!(c.heartbeat_interval_ms, 0);
        assert_eq!(c.log_level, "debug");
    }

    #[test]
    fn node_settings_convert_units() {
        let c = Config {
            heartbeat_interval_ms: 1500,
            read_timeout_ms: 250,
            max_children: 2,
            ..Config::default()
        };
        let s = c.node_settings();
        assert_eq!(s.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(s.read_timeout, Duration::from_millis(250));
        assert_eq!(s.max_children, 2);
        assert_eq!(s.cluster, c.cluster);
    }
}
