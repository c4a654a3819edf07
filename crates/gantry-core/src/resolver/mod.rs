//! Package-manifest-aware import resolution.
//!
//! Maps an import specifier plus a referring file to a concrete file on
//! disk:
//! - Relative specifiers: `./`, `../` joined to the referrer's directory
//! - Bare specifiers: browser-field aliases, then `node_modules` lookup
//!   in nearest-first order
//! - Extension probing and directory resolution (`index.*`, manifest main)
//!
//! Resolution never fails loudly: absence means "leave the specifier
//! unresolved" and the caller falls through.

mod descriptor;

pub use descriptor::{AliasTarget, PackageDescriptor};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Extensions probed when a specifier has none.
pub const DEFAULT_EXTENSIONS: &[&str] = &[".js", ".mjs", ".cjs", ".json"];

/// Parent-walk bound when looking for the enclosing manifest directory.
/// Guards against pathological filesystems (network mounts, loops).
const MAX_MANIFEST_WALK: usize = 10;

/// Bound on browser-field alias chains. Chains are also cycle-checked
/// with a visited set; the cap is belt-only for very long acyclic chains.
const MAX_ALIAS_CHAIN: usize = 32;

/// Node built-in module names. These never resolve to a file; the
/// browser cannot load them and the bundler leaves them external.
const BUILTIN_MODULES: &[&str] = &[
    "assert",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "dns",
    "domain",
    "events",
    "fs",
    "http",
    "http2",
    "https",
    "module",
    "net",
    "os",
    "path",
    "perf_hooks",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "string_decoder",
    "timers",
    "tls",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "worker_threads",
    "zlib",
];

/// Check whether a specifier names a platform built-in.
#[must_use]
pub fn is_builtin(spec: &str) -> bool {
    let name = spec.strip_prefix("node:").unwrap_or(spec);
    let head = name.split('/').next().unwrap_or(name);
    BUILTIN_MODULES.contains(&head)
}

/// Check if a specifier is bare (not relative, not absolute, no scheme).
#[must_use]
pub fn is_bare_specifier(spec: &str) -> bool {
    !spec.starts_with('.')
        && !spec.starts_with('/')
        && !spec.starts_with('\0')
        && !spec.contains("://")
        && !spec.starts_with("data:")
}

/// Extract the package name portion of a bare specifier.
///
/// Handles scoped packages: `@scope/pkg/sub` → `@scope/pkg`.
#[must_use]
pub fn package_name(spec: &str) -> &str {
    let mut slashes = spec.match_indices('/');
    if spec.starts_with('@') {
        match slashes.nth(1) {
            Some((idx, _)) => &spec[..idx],
            None => spec,
        }
    } else {
        match slashes.next() {
            Some((idx, _)) => &spec[..idx],
            None => spec,
        }
    }
}

/// Manifest-aware resolver with process-lifetime memoization.
///
/// Both caches are append-only: dependency trees are assumed immutable
/// for a dev session, so entries are never invalidated (re-resolution
/// happens only on process restart).
pub struct Resolver {
    /// Manifest directory → parsed descriptor.
    descriptors: RwLock<HashMap<PathBuf, Arc<PackageDescriptor>>>,
    /// (referrer, specifier) → result, including negative results.
    cache: RwLock<HashMap<(PathBuf, String), Option<PathBuf>>>,
    /// Extensions probed for extensionless candidates.
    extensions: &'static [&'static str],
    /// Filesystem probe counter, for cache-behavior assertions.
    fs_probes: AtomicU64,
}

impl Resolver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            descriptors: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            extensions: DEFAULT_EXTENSIONS,
            fs_probes: AtomicU64::new(0),
        }
    }

    /// Number of filesystem existence probes performed so far.
    #[must_use]
    pub fn probe_count(&self) -> u64 {
        self.fs_probes.load(Ordering::Relaxed)
    }

    /// Resolve `spec` as imported from `from_file`.
    ///
    /// Returns `None` when the specifier cannot or should not resolve
    /// (built-ins, disabled aliases, missing files). Never errors.
    pub fn resolve(&self, from_file: &Path, spec: &str) -> Option<PathBuf> {
        let key = (from_file.to_path_buf(), spec.to_string());

        if let Some(cached) = self.cache.read().unwrap().get(&key) {
            return cached.clone();
        }

        let result = self.resolve_uncached(from_file, spec);

        self.cache.write().unwrap().insert(key, result.clone());
        result
    }

    fn resolve_uncached(&self, from_file: &Path, spec: &str) -> Option<PathBuf> {
        if spec.is_empty() || spec.starts_with('\0') || spec.contains("://") {
            return None;
        }
        if is_builtin(spec) {
            return None;
        }

        let referrer_dir = from_file.parent().unwrap_or(Path::new("/"));

        // Relative specifiers join to the referrer's directory.
        if spec.starts_with("./") || spec.starts_with("../") {
            return self.resolve_candidate(&referrer_dir.join(spec));
        }

        // Absolute specifiers go straight to candidate search.
        if Path::new(spec).is_absolute() {
            return self.resolve_candidate(Path::new(spec));
        }

        // Bare specifiers: alias table first, then search directories.
        if let Some(descriptor) = self.descriptor_for(from_file) {
            return self.resolve_bare(&descriptor, spec, &mut HashSet::new());
        }

        // No enclosing manifest. `node_modules` lookup still applies,
        // walking up from the referrer's directory.
        for search_dir in descriptor::collect_search_paths(referrer_dir) {
            let base = search_dir.join(spec);
            if let Some(found) = self.resolve_in_package(&base, spec) {
                return Some(found);
            }
        }
        None
    }

    /// Resolve a bare specifier against a package's alias table and
    /// dependency-search directories, nearest first.
    fn resolve_bare(
        &self,
        descriptor: &PackageDescriptor,
        spec: &str,
        visited: &mut HashSet<String>,
    ) -> Option<PathBuf> {
        // Alias chains: a → b → c. Cycles resolve to absent.
        if !visited.insert(spec.to_string()) || visited.len() > MAX_ALIAS_CHAIN {
            return None;
        }

        match descriptor.alias(spec) {
            Some(AliasTarget::Disabled) => return None,
            Some(AliasTarget::Specifier(target)) => {
                let target = target.clone();
                if target.starts_with("./") || target.starts_with("../") {
                    return self.resolve_candidate(&descriptor.root.join(&target));
                }
                if Path::new(&target).is_absolute() {
                    return self.resolve_candidate(Path::new(&target));
                }
                if is_builtin(&target) {
                    return None;
                }
                return self.resolve_bare(descriptor, &target, visited);
            }
            None => {}
        }

        for search_dir in &descriptor.search_paths {
            let base = search_dir.join(spec);
            if let Some(found) = self.resolve_in_package(&base, spec) {
                return Some(found);
            }
        }

        None
    }

    /// Resolve a candidate path inside a search directory, recursing
    /// into the target package's own descriptor for entry and aliases.
    fn resolve_in_package(&self, base: &Path, spec: &str) -> Option<PathBuf> {
        let name = package_name(spec);
        let pkg_root = {
            // Strip the subpath components off `base`. An ancestor-name
            // match would misfire when the subpath's final component
            // equals the package name (`pad/lib/pad`).
            let subpath = spec[name.len()..].trim_start_matches('/');
            let mut root = base.to_path_buf();
            for _ in subpath.split('/').filter(|c| !c.is_empty()) {
                root.pop();
            }
            root
        };

        if spec == name {
            // Whole-package import: use the package's own entry.
            if self.probe(&pkg_root.join("package.json")) {
                let descriptor = self.load_descriptor(&pkg_root)?;
                if let Some(entry) = &descriptor.main_entry {
                    return self.resolve_candidate(entry);
                }
                return self.resolve_candidate(&pkg_root.join("index"));
            }
            return self.resolve_candidate(base);
        }

        // Subpath import: candidate search under the package root, but
        // still honor the package's aliases for the subpath. The alias
        // table keys both the raw specifier and the resolved file path.
        if self.probe(&pkg_root.join("package.json")) {
            if let Some(descriptor) = self.load_descriptor(&pkg_root) {
                let found = self.resolve_candidate(base);
                let found_key = found
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return match descriptor.alias(spec).or_else(|| descriptor.alias(&found_key)) {
                    Some(AliasTarget::Disabled) => None,
                    Some(AliasTarget::Specifier(target)) => {
                        self.resolve_candidate(&pkg_root.join(target.trim_start_matches("./")))
                    }
                    None => found,
                };
            }
        }
        self.resolve_candidate(base)
    }

    /// Candidate-file search: exact file, extension probing, then
    /// directory resolution (manifest entry, `index.*`).
    fn resolve_candidate(&self, base: &Path) -> Option<PathBuf> {
        if self.probe_file(base) {
            return Some(base.to_path_buf());
        }

        let display = base.to_string_lossy();
        for ext in self.extensions {
            let with_ext = PathBuf::from(format!("{display}{ext}"));
            if self.probe_file(&with_ext) {
                return Some(with_ext);
            }
        }

        if self.probe_dir(base) {
            if self.probe(&base.join("package.json")) {
                if let Some(descriptor) = self.load_descriptor(base) {
                    if let Some(entry) = descriptor.main_entry.clone() {
                        // Entry may itself need extension/index probing.
                        if entry != *base {
                            return self.resolve_candidate(&entry);
                        }
                    }
                }
            }
            for ext in self.extensions {
                let index = base.join(format!("index{ext}"));
                if self.probe_file(&index) {
                    return Some(index);
                }
            }
        }

        None
    }

    /// Descriptor for the package enclosing `from_file`, walking parents
    /// up to [`MAX_MANIFEST_WALK`] levels.
    pub fn descriptor_for(&self, from_file: &Path) -> Option<Arc<PackageDescriptor>> {
        let mut dir = from_file.parent();
        for _ in 0..MAX_MANIFEST_WALK {
            let d = dir?;
            if self.probe(&d.join("package.json")) {
                return self.load_descriptor(d);
            }
            dir = d.parent();
        }
        None
    }

    /// Load (or fetch cached) the descriptor for a manifest directory.
    fn load_descriptor(&self, root: &Path) -> Option<Arc<PackageDescriptor>> {
        if let Some(cached) = self.descriptors.read().unwrap().get(root) {
            return Some(Arc::clone(cached));
        }

        let descriptor = Arc::new(PackageDescriptor::load(root, |base| {
            self.resolve_candidate(base)
        })?);

        self.descriptors
            .write()
            .unwrap()
            .insert(root.to_path_buf(), Arc::clone(&descriptor));
        Some(descriptor)
    }

    fn probe(&self, path: &Path) -> bool {
        self.fs_probes.fetch_add(1, Ordering::Relaxed);
        path.exists()
    }

    fn probe_file(&self, path: &Path) -> bool {
        self.fs_probes.fetch_add(1, Ordering::Relaxed);
        path.is_file()
    }

    fn probe_dir(&self, path: &Path) -> bool {
        self.fs_probes.fetch_add(1, Ordering::Relaxed);
        path.is_dir()
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
