//! Configuration file discovery and parsing.
//!
//! Loads `gantry.config.json` from the project root. CLI flags override
//! file values; file values override built-in defaults.

use crate::error::Error;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "gantry.config.json";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Gateway configuration as written in `gantry.config.json`. Every
/// field is optional; absent fields fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Port to listen on.
    pub port: Option<u16>,
    /// Host to bind to.
    pub host: Option<String>,
    /// Static directories searched in order.
    pub static_dirs: Vec<PathBuf>,
    /// Entry file of the application to supervise and forward to.
    pub app_entry: Option<PathBuf>,
    /// Directory of mock definition files.
    pub mock_dir: Option<PathBuf>,
    /// Serve the index page for extensionless GET paths with no match.
    pub spa_fallback: Option<bool>,
    pub bundle: BundleConfig,
    pub inject: InjectConfig,
}

/// Bundler tuning.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleConfig {
    /// Bundle cache directory, relative to the project root.
    pub cache_dir: Option<PathBuf>,
    /// Worker threads for bundling; 0 uses blocking tasks.
    pub workers: Option<usize>,
}

/// Scripts injected into served HTML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InjectConfig {
    pub head: Vec<String>,
    pub body: Vec<String>,
}

impl GatewayConfig {
    /// Port after CLI override, file value, default.
    #[must_use]
    pub fn effective_port(&self, cli: Option<u16>) -> u16 {
        cli.or(self.port).unwrap_or(DEFAULT_PORT)
    }

    /// Host after CLI override, file value, default.
    #[must_use]
    pub fn effective_host(&self, cli: Option<&str>) -> String {
        cli.map(str::to_string)
            .or_else(|| self.host.clone())
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }
}

/// Find `gantry.config.json` in the given root.
#[must_use]
pub fn find_config_file(root: &Path) -> Option<PathBuf> {
    let path = root.join(CONFIG_FILE);
    path.exists().then_some(path)
}

/// Load configuration.
///
/// An explicit `config_path` must exist; without one the file is
/// auto-discovered and its absence just means defaults.
pub fn load_config(
    root: &Path,
    config_path: Option<&Path>,
) -> Result<Option<(PathBuf, GatewayConfig)>, Error> {
    let path = match config_path {
        Some(p) => {
            let abs = if p.is_absolute() { p.to_path_buf() } else { root.join(p) };
            if !abs.exists() {
                return Err(Error::ConfigRead {
                    path: abs,
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
                });
            }
            abs
        }
        None => match find_config_file(root) {
            Some(p) => p,
            None => return Ok(None),
        },
    };

    let text = std::fs::read_to_string(&path).map_err(|source| Error::ConfigRead {
        path: path.clone(),
        source,
    })?;
    let config: GatewayConfig = serde_json::from_str(&text).map_err(|source| Error::ConfigParse {
        path: path.clone(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(Some((path, config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_returns_none_without_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_config_file(dir.path()).is_none());
        assert!(load_config(dir.path(), None).unwrap().is_none());
    }

    #[test]
    fn loads_discovered_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{
                "port": 4000,
                "staticDirs": ["public", "assets"],
                "appEntry": "server.js",
                "bundle": { "workers": 2 },
                "inject": { "head": ["<script>1</script>"] }
            }"#,
        )
        .unwrap();

        let (path, config) = load_config(dir.path(), None).unwrap().unwrap();
        assert_eq!(path, dir.path().join(CONFIG_FILE));
        assert_eq!(config.port, Some(4000));
        assert_eq!(config.static_dirs, [PathBuf::from("public"), PathBuf::from("assets")]);
        assert_eq!(config.app_entry.as_deref(), Some(Path::new("server.js")));
        assert_eq!(config.bundle.workers, Some(2));
        assert_eq!(config.inject.head.len(), 1);
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("other.json");
        match load_config(dir.path(), Some(&missing)) {
            Err(Error::ConfigRead { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected ConfigRead error, got {other:?}"),
        }
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ nope").unwrap();
        match load_config(dir.path(), None) {
            Err(Error::ConfigParse { path, .. }) => {
                assert_eq!(path, dir.path().join(CONFIG_FILE));
            }
            other => panic!("expected ConfigParse error, got {other:?}"),
        }
    }

    #[test]
    fn cli_overrides_beat_file_values() {
        let config = GatewayConfig {
            port: Some(4000),
            host: Some("0.0.0.0".to_string()),
            ..GatewayConfig::default()
        };
        assert_eq!(config.effective_port(Some(5000)), 5000);
        assert_eq!(config.effective_port(None), 4000);
        assert_eq!(GatewayConfig::default().effective_port(None), DEFAULT_PORT);
        assert_eq!(config.effective_host(Some("localhost")), "localhost");
        assert_eq!(config.effective_host(None), "0.0.0.0");
        assert_eq!(GatewayConfig::default().effective_host(None), DEFAULT_HOST);
    }
}
