//! On-demand dependency bundling with a single-flight cache.
//!
//! Each third-party dependency is bundled once per `name@version` key
//! into the cache directory and served to the browser as one ES module.
//! Concurrent requesters for the same key share one pending build and
//! observe an identical outcome; a failed build clears its cache entry
//! so a later request can retry.

mod inline;

pub use inline::{bundle_graph, BundleGraph};

use crate::resolver::Resolver;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bundling failure, cloneable so every waiter on a shared pending
/// build receives the same error.
#[derive(Debug, Clone, Error)]
#[error("bundle failed for {dependency}: {message}")]
pub struct BundleFailure {
    pub dependency: String,
    pub message: String,
}

impl BundleFailure {
    fn new(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            dependency: dependency.into(),
            message: message.into(),
        }
    }
}

/// Bundler configuration.
#[derive(Debug, Clone)]
pub struct BundlerOptions {
    /// Directory holding bundled artifacts.
    pub cache_dir: PathBuf,
    /// Worker threads for CPU-bound bundling. Zero means run builds on
    /// the blocking-task pool instead of a dedicated rayon pool.
    pub workers: usize,
}

type PendingBundle = Shared<BoxFuture<'static, Result<PathBuf, BundleFailure>>>;

enum TaskState {
    /// Build in flight; new callers share this future.
    Pending(PendingBundle),
    /// Artifact on disk. Immutable for the cache's lifetime.
    Ready(PathBuf),
}

/// Single-flight dependency bundler.
pub struct Bundler {
    root: PathBuf,
    options: BundlerOptions,
    resolver: Arc<Resolver>,
    /// Task per `sanitized-name@version` key.
    tasks: Mutex<HashMap<String, TaskState>>,
    /// Artifact stem → original dependency id, for cache-URL requests.
    names: Mutex<HashMap<String, String>>,
    /// Lazily created rayon pool, torn down by [`Bundler::shutdown`].
    pool: Mutex<Option<Arc<rayon::ThreadPool>>>,
}

impl Bundler {
    #[must_use]
    pub fn new(root: PathBuf, resolver: Arc<Resolver>, options: BundlerOptions) -> Self {
        Self {
            root,
            options,
            resolver,
            tasks: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            pool: Mutex::new(None),
        }
    }

    /// The cache directory artifacts are written to.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.options.cache_dir
    }

    /// Scan the cache directory at startup.
    ///
    /// Artifacts for not-yet-known keys are marked ready. When two
    /// artifacts share a dependency name but differ by version, both are
    /// purged: serving an ambiguous stale version is worse than a
    /// rebuild.
    pub fn scan_cache(&self) {
        let Ok(entries) = std::fs::read_dir(&self.options.cache_dir) else {
            return;
        };

        let mut by_name: HashMap<String, Vec<(String, PathBuf)>> = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') || path.extension().map_or(true, |e| e != "js") {
                continue;
            }
            let Some((name, _version)) = stem.rsplit_once('@') else {
                continue;
            };
            by_name
                .entry(name.to_string())
                .or_default()
                .push((stem.to_string(), path.clone()));
        }

        let mut tasks = self.tasks.lock().unwrap();
        for (name, artifacts) in by_name {
            if artifacts.len() > 1 {
                warn!(dependency = %name, "purging ambiguous cached bundle versions");
                for (_, path) in artifacts {
                    let _ = std::fs::remove_file(path);
                }
                continue;
            }
            let (stem, path) = artifacts.into_iter().next().unwrap();
            debug!(key = %stem, "cached bundle marked ready");
            tasks.entry(stem).or_insert(TaskState::Ready(path));
        }
    }

    /// The URL a bare specifier will be served from, or `None` when the
    /// dependency cannot be resolved. Does not trigger a build.
    pub fn dep_url(&self, dependency: &str) -> Option<String> {
        let (key, _entry) = self.key_for(dependency)?;
        Some(format!("/__deps/{key}.js"))
    }

    /// Bundle a dependency, returning the artifact path.
    ///
    /// Single-flight: concurrent calls for one key resolve to the same
    /// path or reject with the same error, and exactly one underlying
    /// build runs. The build is owned by a detached task, so an aborted
    /// requester never corrupts the cache.
    pub async fn bundle(self: &Arc<Self>, dependency: &str) -> Result<PathBuf, BundleFailure> {
        let (key, entry) = self
            .key_for(dependency)
            .ok_or_else(|| BundleFailure::new(dependency, "unresolvable dependency"))?;
        self.bundle_key(&key, &entry, dependency).await
    }

    /// Bundle the dependency behind a cache-URL artifact stem, as used
    /// by `/__deps/{stem}.js` requests.
    pub async fn bundle_stem(self: &Arc<Self>, stem: &str) -> Result<PathBuf, BundleFailure> {
        // Ready or pending keys need no name mapping.
        {
            let tasks = self.tasks.lock().unwrap();
            if let Some(TaskState::Ready(path)) = tasks.get(stem) {
                return Ok(path.clone());
            }
        }
        let dependency = {
            let names = self.names.lock().unwrap();
            names.get(stem).cloned()
        };
        // A stem we never handed out still encodes the dependency id.
        let dependency = dependency
            .or_else(|| dependency_from_stem(stem))
            .ok_or_else(|| BundleFailure::new(stem, "unknown bundle key"))?;
        self.bundle(&dependency).await
    }

    async fn bundle_key(
        self: &Arc<Self>,
        key: &str,
        entry: &Path,
        dependency: &str,
    ) -> Result<PathBuf, BundleFailure> {
        let shared = {
            let mut tasks = self.tasks.lock().unwrap();
            match tasks.get(key) {
                Some(TaskState::Ready(path)) => return Ok(path.clone()),
                Some(TaskState::Pending(shared)) => shared.clone(),
                None => {
                    let (tx, rx) = tokio::sync::oneshot::channel();
                    let dep_for_err = dependency.to_string();
                    let shared: PendingBundle = async move {
                        rx.await.unwrap_or_else(|_| {
                            Err(BundleFailure::new(dep_for_err, "bundle task dropped"))
                        })
                    }
                    .boxed()
                    .shared();
                    tasks.insert(key.to_string(), TaskState::Pending(shared.clone()));

                    self.spawn_build(key.to_string(), entry.to_path_buf(), dependency.to_string(), tx);
                    shared
                }
            }
        };

        shared.await
    }

    /// Run the build on the worker pool (or the blocking pool) from a
    /// detached task, then publish the outcome.
    fn spawn_build(
        self: &Arc<Self>,
        key: String,
        entry: PathBuf,
        dependency: String,
        tx: tokio::sync::oneshot::Sender<Result<PathBuf, BundleFailure>>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.run_build(&key, &entry, &dependency).await;

            {
                let mut tasks = this.tasks.lock().unwrap();
                match &result {
                    Ok(path) => {
                        info!(key = %key, "dependency bundled");
                        tasks.insert(key.clone(), TaskState::Ready(path.clone()));
                    }
                    Err(e) => {
                        // No poisoned cache: the next request may retry.
                        warn!(key = %key, error = %e, "bundle failed");
                        tasks.remove(&key);
                    }
                }
            }

            let _ = tx.send(result);
        });
    }

    async fn run_build(
        &self,
        key: &str,
        entry: &Path,
        dependency: &str,
    ) -> Result<PathBuf, BundleFailure> {
        let out_path = self.options.cache_dir.join(format!("{key}.js"));
        let root = self.options.cache_dir.clone();
        let resolver = Arc::clone(&self.resolver);
        let entry = entry.to_path_buf();
        let dep = dependency.to_string();
        let out = out_path.clone();

        let build = move || -> Result<PathBuf, BundleFailure> {
            let graph = bundle_graph(&entry, &resolver)
                .map_err(|m| BundleFailure::new(dep.clone(), m))?;
            gantry_util::fs::ensure_dir(&root)
                .and_then(|()| gantry_util::fs::atomic_write(&out, graph.code.as_bytes()))
                .map_err(|e| BundleFailure::new(dep.clone(), e.to_string()))?;
            Ok(out)
        };

        if self.options.workers > 0 {
            let pool = self.worker_pool();
            let (btx, brx) = tokio::sync::oneshot::channel();
            pool.spawn(move || {
                let _ = btx.send(build());
            });
            brx.await
                .unwrap_or_else(|_| Err(BundleFailure::new(dependency, "worker pool shut down")))
        } else {
            tokio::task::spawn_blocking(build)
                .await
                .unwrap_or_else(|_| Err(BundleFailure::new(dependency, "build task panicked")))
        }
    }

    /// Lazily create the bounded worker pool.
    fn worker_pool(&self) -> Arc<rayon::ThreadPool> {
        let mut guard = self.pool.lock().unwrap();
        if let Some(pool) = guard.as_ref() {
            return Arc::clone(pool);
        }
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(self.options.workers)
                .thread_name(|i| format!("gantry-bundle-{i}"))
                .build()
                .expect("bundle worker pool"),
        );
        *guard = Some(Arc::clone(&pool));
        pool
    }

    /// Tear down the worker pool. In-flight builds on the blocking pool
    /// are unaffected; future builds recreate the pool lazily.
    pub fn shutdown(&self) {
        self.pool.lock().unwrap().take();
    }

    /// Compute the `sanitized-name@version` key and entry file for a
    /// dependency id, recording the stem → id mapping for cache-URL
    /// requests.
    fn key_for(&self, dependency: &str) -> Option<(String, PathBuf)> {
        // A virtual referrer at the project root puts the root package's
        // search paths in scope.
        let referrer = self.root.join("__gantry__.js");
        let entry = self.resolver.resolve(&referrer, dependency)?;

        let version = self
            .resolver
            .descriptor_for(&entry)
            .and_then(|d| d.version.clone())
            .unwrap_or_else(|| "0.0.0".to_string());

        let key = format!("{}@{version}", sanitize_name(dependency));
        self.names
            .lock()
            .unwrap()
            .insert(key.clone(), dependency.to_string());
        Some((key, entry))
    }
}

/// Invert [`sanitize_name`] on an artifact stem: `scope__pkg@1.0.0`
/// names `@scope/pkg`, `lodash@4.17.21` names `lodash`.
fn dependency_from_stem(stem: &str) -> Option<String> {
    let (name, _version) = stem.rsplit_once('@')?;
    if name.is_empty() {
        return None;
    }
    if name.contains("__") {
        Some(format!("@{}", name.replace("__", "/")))
    } else {
        Some(name.to_string())
    }
}

/// Sanitize a dependency id for use as a filename stem.
///
/// `@scope/pkg` → `scope__pkg`; the version separator `@` stays unique
/// because scope markers are stripped.
#[must_use]
pub fn sanitize_name(dependency: &str) -> String {
    dependency.replace('/', "__").replace('@', "")
}
