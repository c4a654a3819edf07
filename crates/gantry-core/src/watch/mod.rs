//! Filesystem watching and the change-driven coordinator.
//!
//! A [`WatchSet`] owns the native watcher and the filtered set of
//! watched paths. Raw events funnel through a coalescing pump (50ms
//! window) into the [`WatchCoordinator`], which invalidates caches,
//! restarts the supervised app when one of its files changed, and tells
//! the reload broadcaster what to push.

use crate::app::AppSupervisor;
use crate::reload::{ReloadBroadcaster, ReloadMessage};
use crate::transform::TransformCache;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Event coalescing window.
const COALESCE_WINDOW: Duration = Duration::from_millis(50);

/// Filtered, idempotent set of watched paths.
pub struct WatchSet {
    watcher: Mutex<Option<RecommendedWatcher>>,
    watched: Arc<Mutex<HashSet<PathBuf>>>,
    /// Directories whose contents never trigger watches, e.g. the
    /// bundle cache the bundler itself writes into.
    excluded_dirs: Vec<PathBuf>,
}

impl WatchSet {
    /// Create the set and its native watcher. Changed paths arrive on
    /// `tx` unfiltered by time; the pump coalesces them.
    pub fn new(
        excluded_dirs: Vec<PathBuf>,
        tx: mpsc::UnboundedSender<PathBuf>,
    ) -> notify::Result<Self> {
        let watched = Arc::new(Mutex::new(HashSet::new()));
        let handler_watched = Arc::clone(&watched);
        let handler_excluded = excluded_dirs.clone();

        let watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "watch error");
                        return;
                    }
                };
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                let removed = matches!(event.kind, EventKind::Remove(_));
                for path in event.paths {
                    if !path_is_watchable(&path, &handler_excluded) {
                        continue;
                    }
                    if removed {
                        handler_watched.lock().unwrap().remove(&path);
                    }
                    let _ = tx.send(path);
                }
            },
            Config::default(),
        )?;

        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            watched,
            excluded_dirs,
        })
    }

    /// Watch a path. Idempotent; filtered paths and paths that cannot
    /// be watched return false.
    pub fn add(&self, path: &Path) -> bool {
        if !path_is_watchable(path, &self.excluded_dirs) {
            return false;
        }
        if self.watched.lock().unwrap().contains(path) {
            return true;
        }
        let mut guard = self.watcher.lock().unwrap();
        let Some(watcher) = guard.as_mut() else {
            return false;
        };
        let mode = if path.is_dir() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        match watcher.watch(path, mode) {
            Ok(()) => {
                self.watched.lock().unwrap().insert(path.to_path_buf());
                tracing::debug!(path = %path.display(), "watching");
                true
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot watch");
                false
            }
        }
    }

    /// Stop watching a path.
    pub fn remove(&self, path: &Path) {
        if self.watched.lock().unwrap().remove(path) {
            if let Some(watcher) = self.watcher.lock().unwrap().as_mut() {
                let _ = watcher.unwatch(path);
            }
        }
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.watched.lock().unwrap().contains(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.watched.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watched.lock().unwrap().is_empty()
    }

    /// Drop the native watcher and forget every path.
    pub fn close(&self) {
        *self.watcher.lock().unwrap() = None;
        self.watched.lock().unwrap().clear();
    }
}

/// Dotfiles, vendored dependency trees and excluded directories never
/// trigger watches.
fn path_is_watchable(path: &Path, excluded_dirs: &[PathBuf]) -> bool {
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name == "node_modules" || (name.starts_with('.') && name.len() > 1 && name != "..") {
            return false;
        }
    }
    !excluded_dirs.iter().any(|dir| path.starts_with(dir))
}

/// Reacts to coalesced change batches.
pub struct WatchCoordinator {
    transform_cache: Option<Arc<TransformCache>>,
    broadcaster: ReloadBroadcaster,
    supervisor: Option<Arc<AppSupervisor>>,
    /// Files belonging to the supervised app; a change here restarts it.
    app_deps: RwLock<HashSet<PathBuf>>,
    /// Disk path → served URL, for refresh targeting.
    served_urls: RwLock<HashMap<PathBuf, String>>,
    last_changed: Mutex<Option<PathBuf>>,
}

impl WatchCoordinator {
    pub fn new(
        broadcaster: ReloadBroadcaster,
        transform_cache: Option<Arc<TransformCache>>,
        supervisor: Option<Arc<AppSupervisor>>,
    ) -> Self {
        Self {
            transform_cache,
            broadcaster,
            supervisor,
            app_deps: RwLock::new(HashSet::new()),
            served_urls: RwLock::new(HashMap::new()),
            last_changed: Mutex::new(None),
        }
    }

    /// Remember which URL a disk path was served under.
    pub fn record_served_url(&self, path: &Path, url: &str) {
        self.served_urls
            .write()
            .unwrap()
            .insert(path.to_path_buf(), url.to_string());
    }

    /// Mark a file as part of the supervised app's dependency set.
    pub fn register_app_dependency(&self, path: &Path) {
        self.app_deps.write().unwrap().insert(path.to_path_buf());
    }

    /// Most recently changed path, if any change was seen.
    #[must_use]
    pub fn last_changed(&self) -> Option<PathBuf> {
        self.last_changed.lock().unwrap().clone()
    }

    /// Handle one coalesced batch of changed paths.
    ///
    /// Order per change: record, invalidate transpile cache, restart
    /// the app if needed, then notify clients. A batch with any
    /// non-style change collapses to a single full reload; a pure style
    /// batch refreshes each stylesheet in place.
    pub fn handle_batch(&self, paths: &HashSet<PathBuf>) {
        if paths.is_empty() {
            return;
        }

        let mut needs_restart = false;
        for path in paths {
            tracing::debug!(path = %path.display(), "file changed");
            *self.last_changed.lock().unwrap() = Some(path.clone());
            if let Some(cache) = &self.transform_cache {
                cache.invalidate(path);
            }
            if self.app_deps.read().unwrap().contains(path) {
                needs_restart = true;
            }
        }

        if needs_restart {
            if let Some(supervisor) = &self.supervisor {
                supervisor.request_restart();
            }
        }

        let messages = self.classify(paths);
        for message in messages {
            match message {
                ReloadMessage::Reload => {
                    self.broadcaster.notify_reload();
                }
                ReloadMessage::Refresh { file_path } => {
                    let served = self
                        .served_urls
                        .read()
                        .unwrap()
                        .get(Path::new(&file_path))
                        .cloned()
                        .unwrap_or(file_path);
                    let _ = self
                        .broadcaster
                        .notify_change(Path::new(&served));
                }
            }
        }
    }

    fn classify(&self, paths: &HashSet<PathBuf>) -> Vec<ReloadMessage> {
        let mut refreshes = Vec::new();
        for path in paths {
            match ReloadMessage::for_path(path) {
                ReloadMessage::Reload => return vec![ReloadMessage::Reload],
                refresh => refreshes.push(refresh),
            }
        }
        refreshes
    }
}

/// Run the coalescing pump until the sender side closes. Each batch
/// collects everything arriving within the window after the first
/// event.
pub async fn run_pump(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    coordinator: Arc<WatchCoordinator>,
) {
    while let Some(batch) = next_batch(&mut rx).await {
        coordinator.handle_batch(&batch);
    }
}

async fn next_batch(rx: &mut mpsc::UnboundedReceiver<PathBuf>) -> Option<HashSet<PathBuf>> {
    let first = rx.recv().await?;
    let mut batch = HashSet::from([first]);
    loop {
        match tokio::time::timeout(COALESCE_WINDOW, rx.recv()).await {
            Ok(Some(path)) => {
                batch.insert(path);
            }
            Ok(None) | Err(_) => break,
        }
    }
    Some(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppInstance, AppLifecycle};
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn filtering_rejects_dotfiles_vendored_trees_and_cache_dir() {
        let excluded = vec![PathBuf::from("/proj/.gantry/deps")];
        assert!(path_is_watchable(Path::new("/proj/src/app.js"), &excluded));
        assert!(!path_is_watchable(Path::new("/proj/.git/HEAD"), &excluded));
        assert!(!path_is_watchable(
            Path::new("/proj/node_modules/left-pad/index.js"),
            &excluded
        ));
        assert!(!path_is_watchable(Path::new("/proj/.gantry/deps/x.js"), &excluded));
    }

    #[test]
    fn add_is_idempotent_and_remove_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.js");
        std::fs::write(&file, "x").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let set = WatchSet::new(Vec::new(), tx).unwrap();

        assert!(set.add(&file));
        assert!(set.add(&file));
        assert_eq!(set.len(), 1);

        set.remove(&file);
        assert!(set.is_empty());

        set.close();
        assert!(!set.add(&file));
    }

    #[test]
    fn add_rejects_filtered_and_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let set = WatchSet::new(Vec::new(), tx).unwrap();

        assert!(!set.add(&dir.path().join(".env")));
        assert!(!set.add(&dir.path().join("missing.js")));
        assert!(set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pump_coalesces_a_burst_into_one_batch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(PathBuf::from("a.js")).unwrap();
        tx.send(PathBuf::from("b.js")).unwrap();
        tx.send(PathBuf::from("a.js")).unwrap();
        drop(tx);

        let batch = next_batch(&mut rx).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(next_batch(&mut rx).await.is_none());
    }

    #[test]
    fn style_only_batch_refreshes_mixed_batch_reloads() {
        let coordinator = WatchCoordinator::new(ReloadBroadcaster::new(), None, None);
        coordinator.record_served_url(Path::new("src/app.css"), "/assets/app.css");
        let mut rx = coordinator.broadcaster.subscribe();

        coordinator.handle_batch(&HashSet::from([PathBuf::from("src/app.css")]));
        assert_eq!(
            rx.try_recv().unwrap(),
            ReloadMessage::Refresh {
                file_path: "/assets/app.css".to_string()
            }
        );

        coordinator.handle_batch(&HashSet::from([
            PathBuf::from("src/app.css"),
            PathBuf::from("src/app.js"),
        ]));
        assert_eq!(rx.try_recv().unwrap(), ReloadMessage::Reload);
        assert!(rx.try_recv().is_err());
        assert!(coordinator.last_changed().is_some());
    }

    struct NoopLifecycle {
        starts: AtomicUsize,
    }

    impl AppLifecycle for NoopLifecycle {
        fn start(&self, _entry: &Path) -> Result<AppInstance, Error> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(AppInstance {
                port: 4100,
                handle: Box::new(()),
            })
        }

        fn stop(&self, _instance: AppInstance) {}
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn app_dependency_change_triggers_restart() {
        let lifecycle = Arc::new(NoopLifecycle {
            starts: AtomicUsize::new(0),
        });
        let supervisor = Arc::new(AppSupervisor::new(
            Arc::clone(&lifecycle) as Arc<dyn AppLifecycle>,
            PathBuf::from("server.js"),
            Duration::from_millis(500),
        ));
        supervisor.start().await.unwrap();

        let coordinator =
            WatchCoordinator::new(ReloadBroadcaster::new(), None, Some(Arc::clone(&supervisor)));
        coordinator.register_app_dependency(Path::new("server.js"));

        coordinator.handle_batch(&HashSet::from([PathBuf::from("server.js")]));
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if lifecycle.starts.load(Ordering::SeqCst) >= 2 {
                break;
            }
        }
        assert_eq!(lifecycle.starts.load(Ordering::SeqCst), 2);

        // A non-dependency change leaves the app alone.
        coordinator.handle_batch(&HashSet::from([PathBuf::from("README.md")]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lifecycle.starts.load(Ordering::SeqCst), 2);
    }
}
