//! Parsed package-manifest descriptor.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Target of a browser-field alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasTarget {
    /// Replace the specifier with another specifier or relative path.
    Specifier(String),
    /// `false` in the manifest: the module is disabled for the browser
    /// and resolves to absent.
    Disabled,
}

/// A parsed manifest, cached per manifest directory for the process
/// lifetime. Dependency trees are assumed immutable mid-session.
#[derive(Debug, Clone)]
pub struct PackageDescriptor {
    /// Manifest directory (package root).
    pub root: PathBuf,
    /// Package name, if declared.
    pub name: Option<String>,
    /// Package version, if declared.
    pub version: Option<String>,
    /// Entry file: browser string form > module > main, candidate-resolved.
    pub main_entry: Option<PathBuf>,
    /// Browser-field alias table (map form). Keys are stored both raw
    /// and, for relative keys, as the candidate-resolved absolute path.
    aliases: HashMap<String, AliasTarget>,
    /// Every `node_modules` directory reachable from the package root
    /// up to the filesystem root, nearest first.
    pub search_paths: Vec<PathBuf>,
}

impl PackageDescriptor {
    /// Parse the manifest in `root`.
    ///
    /// `candidates` is the resolver's candidate-file search, used to
    /// normalize relative alias keys and the entry path. Returns `None`
    /// when the manifest is missing or unparseable (the caller treats
    /// the directory as plain).
    pub fn load(
        root: &Path,
        candidates: impl Fn(&Path) -> Option<PathBuf>,
    ) -> Option<Self> {
        let manifest_path = root.join("package.json");
        let text = std::fs::read_to_string(&manifest_path).ok()?;
        let manifest: Value = serde_json::from_str(&text).ok()?;

        let name = manifest
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let version = manifest
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut aliases = HashMap::new();
        let mut browser_entry: Option<String> = None;

        match manifest.get("browser") {
            Some(Value::String(s)) => browser_entry = Some(s.clone()),
            Some(Value::Object(map)) => {
                for (key, value) in map {
                    let target = match value {
                        Value::String(s) => AliasTarget::Specifier(s.clone()),
                        Value::Bool(false) => AliasTarget::Disabled,
                        _ => continue,
                    };
                    // Relative keys also get a resolved-path form so a
                    // lookup by resolved file hits the alias.
                    if key.starts_with("./") || key.starts_with("../") {
                        if let Some(resolved) = candidates(&root.join(key.trim_start_matches("./")))
                        {
                            aliases.insert(resolved.to_string_lossy().into_owned(), target.clone());
                        }
                    }
                    aliases.insert(key.clone(), target);
                }
            }
            _ => {}
        }

        let raw_entry = browser_entry
            .or_else(|| {
                manifest
                    .get("module")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .or_else(|| {
                manifest
                    .get("main")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });

        let main_entry = raw_entry
            .map(|e| root.join(e.trim_start_matches("./")))
            .and_then(|p| candidates(&p).or(Some(p)));

        Some(Self {
            root: root.to_path_buf(),
            name,
            version,
            main_entry,
            aliases,
            search_paths: collect_search_paths(root),
        })
    }

    /// Look up an alias for a specifier.
    #[must_use]
    pub fn alias(&self, spec: &str) -> Option<&AliasTarget> {
        self.aliases.get(spec)
    }

    /// `name@version` key used by the bundle cache, when both are known.
    #[must_use]
    pub fn cache_key(&self) -> Option<String> {
        match (&self.name, &self.version) {
            (Some(n), Some(v)) => Some(format!("{n}@{v}")),
            _ => None,
        }
    }
}

/// Every existing `node_modules` directory from `root` up to the
/// filesystem root, nearest first.
pub(super) fn collect_search_paths(root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut dir = Some(root);
    while let Some(d) = dir {
        // Skip node_modules/node_modules nesting artifacts
        if d.file_name().map_or(true, |n| n != "node_modules") {
            let candidate = d.join("node_modules");
            if candidate.is_dir() {
                paths.push(candidate);
            }
        }
        dir = d.parent();
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn entry_prefers_module_over_main() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(
            root.join("package.json"),
            r#"{"name": "p", "version": "0.1.0", "main": "cjs.js", "module": "esm.js"}"#,
        )
        .unwrap();
        fs::write(root.join("cjs.js"), "").unwrap();
        fs::write(root.join("esm.js"), "").unwrap();

        let d = PackageDescriptor::load(root, |p| p.is_file().then(|| p.to_path_buf())).unwrap();
        assert_eq!(d.main_entry.unwrap(), root.join("esm.js"));
    }

    #[test]
    fn search_paths_are_nearest_first() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let nested = root.join("packages/app");
        fs::create_dir_all(nested.join("node_modules")).unwrap();
        fs::create_dir_all(root.join("node_modules")).unwrap();
        fs::write(nested.join("package.json"), r#"{"name": "app"}"#).unwrap();

        let d = PackageDescriptor::load(&nested, |_| None).unwrap();
        assert!(d.search_paths.len() >= 2);
        assert_eq!(d.search_paths[0], nested.join("node_modules"));
        assert_eq!(d.search_paths[1], root.join("node_modules"));
    }

    #[test]
    fn unparseable_manifest_is_none() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("package.json"), "not json {").unwrap();
        assert!(PackageDescriptor::load(dir.path(), |_| None).is_none());
    }

    #[test]
    fn cache_key_needs_name_and_version() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"name": "p", "version": "1.2.3"}"#,
        )
        .unwrap();
        let d = PackageDescriptor::load(dir.path(), |_| None).unwrap();
        assert_eq!(d.cache_key().unwrap(), "p@1.2.3");
    }
}
