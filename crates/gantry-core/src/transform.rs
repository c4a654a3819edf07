//! On-the-fly source transforms with a memoizing cache.
//!
//! Transformers are pluggable and synchronous; the cache runs them on
//! blocking threads and single-flights concurrent requests for the same
//! file, so a hot module is only transpiled once per change.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Transforms a source file before it is served.
pub trait Transformer: Send + Sync + 'static {
    /// Produce the transformed text for the file, or `None` when this
    /// transformer does not handle it (it is then served as-is). The
    /// transformer reads the file itself; `is_server` selects
    /// server-side output where the two differ.
    fn transform(&self, path: &Path, is_server: bool) -> Option<String>;

    /// Whether this transformer would handle the file at all. Used to
    /// skip the cache for plain assets.
    fn handles(&self, path: &Path) -> bool;
}

type CachedOutput = Option<Arc<str>>;

#[derive(Clone)]
enum CacheState {
    /// In-flight computation, tagged with the generation that started it
    /// so a stale computation cannot publish over a newer entry.
    Pending(u64, Shared<BoxFuture<'static, CachedOutput>>),
    Ready(CachedOutput),
}

/// Memoizing front of a [`Transformer`]. Entries live until the watcher
/// invalidates them.
pub struct TransformCache {
    transformer: Arc<dyn Transformer>,
    entries: Mutex<HashMap<PathBuf, CacheState>>,
    generation: AtomicU64,
}

impl TransformCache {
    pub fn new(transformer: Arc<dyn Transformer>) -> Self {
        Self {
            transformer,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Whether the underlying transformer handles this file.
    #[must_use]
    pub fn handles(&self, path: &Path) -> bool {
        self.transformer.handles(path)
    }

    /// Transformed contents of `path`, computed at most once per
    /// invalidation regardless of concurrent callers.
    pub async fn get(&self, path: &Path) -> CachedOutput {
        let (generation, pending) = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(path) {
                Some(CacheState::Ready(output)) => return output.clone(),
                Some(CacheState::Pending(generation, fut)) => (*generation, fut.clone()),
                None => {
                    let transformer = Arc::clone(&self.transformer);
                    let owned = path.to_path_buf();
                    let fut = async move {
                        let result = tokio::task::spawn_blocking(move || {
                            transformer.transform(&owned, false)
                        })
                        .await;
                        match result {
                            Ok(output) => output.map(Arc::from),
                            Err(e) => {
                                tracing::warn!(error = %e, "transform task panicked");
                                None
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    entries.insert(path.to_path_buf(), CacheState::Pending(generation, fut.clone()));
                    (generation, fut)
                }
            }
        };

        let output = pending.await;
        let mut entries = self.entries.lock().unwrap();
        // An invalidation may have raced the computation, and a newer
        // request may already own the slot; only publish when the
        // pending entry is still the one we awaited.
        if matches!(entries.get(path), Some(CacheState::Pending(g, _)) if *g == generation) {
            entries.insert(path.to_path_buf(), CacheState::Ready(output.clone()));
        }
        output
    }

    /// Drop the cached output for a changed file.
    pub fn invalidate(&self, path: &Path) {
        if self.entries.lock().unwrap().remove(path).is_some() {
            tracing::debug!(path = %path.display(), "transform cache invalidated");
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Upcase {
        runs: AtomicUsize,
        delay: std::time::Duration,
    }

    impl Transformer for Upcase {
        fn transform(&self, path: &Path, _is_server: bool) -> Option<String> {
            if !self.handles(path) {
                return None;
            }
            let source = std::fs::read_to_string(path).ok()?;
            self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            Some(source.to_uppercase())
        }

        fn handles(&self, path: &Path) -> bool {
            path.extension().and_then(|e| e.to_str()) == Some("up")
        }
    }

    fn cache_with_delay(delay: std::time::Duration) -> (Arc<TransformCache>, Arc<Upcase>) {
        let transformer = Arc::new(Upcase {
            runs: AtomicUsize::new(0),
            delay,
        });
        (
            Arc::new(TransformCache::new(Arc::clone(&transformer) as Arc<dyn Transformer>)),
            transformer,
        )
    }

    fn cache() -> (Arc<TransformCache>, Arc<Upcase>) {
        cache_with_delay(std::time::Duration::ZERO)
    }

    #[tokio::test]
    async fn memoizes_until_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.up");
        std::fs::write(&file, "abc").unwrap();
        let (cache, transformer) = cache();

        assert_eq!(cache.get(&file).await.as_deref(), Some("ABC"));
        assert_eq!(cache.get(&file).await.as_deref(), Some("ABC"));
        assert_eq!(transformer.runs.load(Ordering::SeqCst), 1);

        std::fs::write(&file, "def").unwrap();
        cache.invalidate(&file);
        assert_eq!(cache.get(&file).await.as_deref(), Some("DEF"));
        assert_eq!(transformer.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.up");
        std::fs::write(&file, "xyz").unwrap();
        let (cache, transformer) = cache();

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let file = file.clone();
            set.spawn(async move { cache.get(&file).await });
        }
        while let Some(result) = set.join_next().await {
            assert_eq!(result.unwrap().as_deref(), Some("XYZ"));
        }
        assert_eq!(transformer.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_computation_does_not_publish_over_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.up");
        std::fs::write(&file, "old").unwrap();
        let (cache, _) = cache_with_delay(std::time::Duration::from_millis(150));

        // Slow first computation reads "old", then sleeps.
        let first = {
            let cache = Arc::clone(&cache);
            let file = file.clone();
            tokio::spawn(async move { cache.get(&file).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        // Change and invalidate while the first computation is still in
        // flight, then start a fresh one.
        std::fs::write(&file, "new").unwrap();
        cache.invalidate(&file);
        let fresh = {
            let cache = Arc::clone(&cache);
            let file = file.clone();
            tokio::spawn(async move { cache.get(&file).await })
        };

        assert_eq!(first.await.unwrap().as_deref(), Some("OLD"));
        assert_eq!(fresh.await.unwrap().as_deref(), Some("NEW"));
        // The stale result must not have replaced the fresh entry.
        assert_eq!(cache.get(&file).await.as_deref(), Some("NEW"));
    }

    #[tokio::test]
    async fn unhandled_files_yield_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, "hi").unwrap();
        let (cache, _) = cache();

        assert!(!cache.handles(&file));
        assert!(cache.get(&file).await.is_none());
    }

    #[tokio::test]
    async fn missing_file_yields_none() {
        let (cache, _) = cache();
        assert!(cache.get(Path::new("/does/not/exist.up")).await.is_none());
    }
}
