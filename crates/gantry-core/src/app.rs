//! Supervised application process behind the gateway.
//!
//! The application under development is started through a pluggable
//! [`AppLifecycle`] and proxied to by port. Restarts triggered by file
//! changes serialize behind a write gate: forwarded requests hold the
//! read side, so they either see the old instance or wait for the new
//! one, never a half-started app.

use crate::error::Error;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(2);

/// A running application.
pub struct AppInstance {
    /// Local port the app listens on.
    pub port: u16,
    /// Opaque process handle owned by the lifecycle.
    pub handle: Box<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for AppInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppInstance").field("port", &self.port).finish()
    }
}

/// Starts and stops application instances. Implementations are
/// synchronous; the supervisor runs them on blocking threads.
pub trait AppLifecycle: Send + Sync + 'static {
    /// Launch the app from its entry file and report the listening
    /// port. Blocks until the app is ready to accept connections.
    fn start(&self, entry: &Path) -> Result<AppInstance, Error>;

    /// Tear an instance down.
    fn stop(&self, instance: AppInstance);
}

#[derive(Default)]
struct RestartState {
    restarting: bool,
    dirty: bool,
}

/// Owns the live instance and serializes restarts.
pub struct AppSupervisor {
    lifecycle: Arc<dyn AppLifecycle>,
    entry: PathBuf,
    start_timeout: Duration,
    instance: RwLock<Option<AppInstance>>,
    restart: std::sync::Mutex<RestartState>,
    shutting_down: AtomicBool,
    /// Serializes the actual stop/start work across restart tasks.
    work: Mutex<()>,
}

impl AppSupervisor {
    pub fn new(lifecycle: Arc<dyn AppLifecycle>, entry: PathBuf, start_timeout: Duration) -> Self {
        Self {
            lifecycle,
            entry,
            start_timeout,
            instance: RwLock::new(None),
            restart: std::sync::Mutex::new(RestartState::default()),
            shutting_down: AtomicBool::new(false),
            work: Mutex::new(()),
        }
    }

    /// Start the initial instance.
    pub async fn start(&self) -> Result<u16, Error> {
        let instance = self.launch().await?;
        let port = instance.port;
        *self.instance.write().await = Some(instance);
        tracing::info!(port, "app started");
        Ok(port)
    }

    /// Port of the live instance. Waits out an in-progress restart.
    pub async fn current_port(&self) -> Option<u16> {
        self.instance.read().await.as_ref().map(|i| i.port)
    }

    /// Ask for a restart. Calls arriving while one is in flight collapse
    /// into at most one follow-up restart.
    pub fn request_restart(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.restart.lock().unwrap();
            if state.restarting {
                state.dirty = true;
                return;
            }
            state.restarting = true;
        }

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                supervisor.restart_once().await;
                let mut state = supervisor.restart.lock().unwrap();
                if state.dirty && !supervisor.shutting_down.load(Ordering::SeqCst) {
                    state.dirty = false;
                } else {
                    state.restarting = false;
                    break;
                }
            }
        });
    }

    async fn restart_once(&self) {
        let _work = self.work.lock().await;
        // Write gate: forwarded requests block here until the new
        // instance is live.
        let mut slot = self.instance.write().await;
        if let Some(old) = slot.take() {
            self.stop_instance(old).await;
        }
        match self.launch().await {
            Ok(instance) => {
                tracing::info!(port = instance.port, "app restarted");
                *slot = Some(instance);
            }
            Err(e) => {
                tracing::error!(error = %e, "app restart failed");
            }
        }
    }

    /// Stop the live instance and refuse further restarts.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _work = self.work.lock().await;
        if let Some(instance) = self.instance.write().await.take() {
            self.stop_instance(instance).await;
        }
    }

    async fn launch(&self) -> Result<AppInstance, Error> {
        let lifecycle = Arc::clone(&self.lifecycle);
        let entry = self.entry.clone();
        let mut task = tokio::task::spawn_blocking(move || lifecycle.start(&entry));
        match tokio::time::timeout(self.start_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::AppStart {
                entry: self.entry.clone(),
                message: format!("start task panicked: {join}"),
            }),
            Err(_) => {
                // The blocking start keeps running past the timeout. If it
                // eventually produces an instance, stop it so the process
                // and its port are not leaked.
                let lifecycle = Arc::clone(&self.lifecycle);
                tokio::spawn(async move {
                    if let Ok(Ok(instance)) = task.await {
                        tracing::warn!(
                            port = instance.port,
                            "stopping app instance that came up after the start timeout"
                        );
                        let _ = tokio::task::spawn_blocking(move || lifecycle.stop(instance)).await;
                    }
                });
                Err(Error::AppStartTimeout {
                    timeout_ms: self.start_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn stop_instance(&self, instance: AppInstance) {
        let lifecycle = Arc::clone(&self.lifecycle);
        if let Err(e) = tokio::task::spawn_blocking(move || lifecycle.stop(instance)).await {
            tracing::warn!(error = %e, "app stop task panicked");
        }
    }
}
