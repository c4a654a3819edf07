//! `gantry serve`, the command that runs the gateway over a project directory.

use clap::Args;
use gantry_core::app::{AppInstance, AppLifecycle, AppSupervisor, DEFAULT_START_TIMEOUT};
use gantry_core::bundle::{Bundler, BundlerOptions};
use gantry_core::config::{load_config, GatewayConfig};
use gantry_core::error::Error;
use gantry_core::mock::load_mock_dir;
use gantry_core::watch::{run_pump, WatchCoordinator, WatchSet};
use gantry_core::{GatewayState, Resolver};
use miette::{IntoDiagnostic, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

/// Subdirectory of the project root holding bundle artifacts.
const CACHE_DIR: &str = ".gantry/deps";

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Static directory to serve (repeatable, searched in order)
    #[arg(long = "static", value_name = "DIR")]
    pub static_dirs: Vec<PathBuf>,

    /// Application entry file to supervise and forward to
    #[arg(long, value_name = "FILE")]
    pub app: Option<PathBuf>,

    /// Command used to launch the application entry
    #[arg(long, default_value = "node")]
    pub runner: String,

    /// Directory of mock definition files
    #[arg(long, value_name = "DIR")]
    pub mocks: Option<PathBuf>,

    /// Config file (defaults to discovering gantry.config.json)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Bundler worker threads (0 runs builds on blocking tasks)
    #[arg(long)]
    pub workers: Option<usize>,
}

pub fn run(cwd: &Path, args: ServeArgs) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().into_diagnostic()?;
    rt.block_on(serve(cwd, args))
}

async fn serve(cwd: &Path, args: ServeArgs) -> Result<()> {
    let root = cwd.canonicalize().into_diagnostic()?;

    let mut config = match load_config(&root, args.config.as_deref()).into_diagnostic()? {
        Some((path, config)) => {
            let rel = path.strip_prefix(&root).unwrap_or(&path);
            println!("  Loaded config from {}", rel.display());
            config
        }
        None => GatewayConfig::default(),
    };
    merge_cli(&mut config, &args);

    let port = config.effective_port(args.port);
    let host = config.effective_host(args.host.as_deref());
    let cache_dir = root.join(config.bundle.cache_dir.as_deref().unwrap_or(Path::new(CACHE_DIR)));

    let mut state = GatewayState::new(root.clone(), &config);

    if let Some(dir) = &config.mock_dir {
        let dir = if dir.is_absolute() { dir.clone() } else { root.join(dir) };
        let loaded = load_mock_dir(&state.mocks, &dir);
        println!("  Loaded {loaded} mock definition{}", if loaded == 1 { "" } else { "s" });
    }

    if root.join("node_modules").is_dir() {
        let bundler = Arc::new(Bundler::new(
            root.clone(),
            Arc::new(Resolver::new()),
            BundlerOptions {
                cache_dir: cache_dir.clone(),
                workers: config.bundle.workers.unwrap_or(0),
            },
        ));
        bundler.scan_cache();
        state.bundler = Some(bundler);
    }

    let supervisor = match &config.app_entry {
        Some(entry) => {
            let entry = if entry.is_absolute() { entry.clone() } else { root.join(entry) };
            let lifecycle = Arc::new(ProcessLifecycle::new(args.runner.clone()));
            let supervisor = Arc::new(AppSupervisor::new(lifecycle, entry.clone(), DEFAULT_START_TIMEOUT));
            let app_port = supervisor.start().await.into_diagnostic()?;
            println!("  Application listening on port {app_port}");
            state.supervisor = Some(Arc::clone(&supervisor));
            Some((supervisor, entry))
        }
        None => None,
    };

    let (watch_tx, watch_rx) = tokio::sync::mpsc::unbounded_channel();
    let watch = Arc::new(WatchSet::new(vec![cache_dir], watch_tx).into_diagnostic()?);
    watch.add(&root);
    let coordinator = Arc::new(WatchCoordinator::new(
        state.broadcaster.clone(),
        state.transforms.clone(),
        supervisor.as_ref().map(|(s, _)| Arc::clone(s)),
    ));
    if let Some((_, entry)) = &supervisor {
        coordinator.register_app_dependency(entry);
    }
    tokio::spawn(run_pump(watch_rx, Arc::clone(&coordinator)));
    state.watch = Some(watch);
    state.coordinator = Some(coordinator);

    let app = gantry_core::router(Arc::new(state)).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}"))
        .await
        .into_diagnostic()?;
    println!("  gantry serving on http://{host}:{port}");
    tracing::info!(%host, port, "gateway listening");
    axum::serve(listener, app).await.into_diagnostic()?;
    Ok(())
}

/// CLI flags override file values.
fn merge_cli(config: &mut GatewayConfig, args: &ServeArgs) {
    if !args.static_dirs.is_empty() {
        config.static_dirs = args.static_dirs.clone();
    }
    if args.app.is_some() {
        config.app_entry = args.app.clone();
    }
    if args.mocks.is_some() {
        config.mock_dir = args.mocks.clone();
    }
    if args.workers.is_some() {
        config.bundle.workers = args.workers;
    }
}

/// Lifecycle adapter that runs the entry file as a child process. The
/// child gets its port through the `PORT` environment variable; start
/// blocks until the port accepts connections.
struct ProcessLifecycle {
    runner: String,
    /// Port of the previous instance. Restarts rebind it so
    /// app-relative absolute URLs stay stable across restarts.
    last_port: std::sync::Mutex<Option<u16>>,
}

impl ProcessLifecycle {
    fn new(runner: String) -> Self {
        Self {
            runner,
            last_port: std::sync::Mutex::new(None),
        }
    }

    /// The previous instance's port when it can be rebound, otherwise a
    /// fresh ephemeral one.
    fn pick_port(&self) -> Result<u16, Error> {
        if let Some(prev) = *self.last_port.lock().unwrap() {
            if std::net::TcpListener::bind(("127.0.0.1", prev)).is_ok() {
                return Ok(prev);
            }
        }
        free_port()
    }
}

const READY_POLL: Duration = Duration::from_millis(50);
const READY_DEADLINE: Duration = Duration::from_secs(2);

impl AppLifecycle for ProcessLifecycle {
    fn start(&self, entry: &Path) -> Result<AppInstance, Error> {
        let port = self.pick_port()?;
        let mut child = Command::new(&self.runner)
            .arg(entry)
            .env("PORT", port.to_string())
            .spawn()
            .map_err(|e| Error::AppStart {
                entry: entry.to_path_buf(),
                message: format!("cannot launch {}: {e}", self.runner),
            })?;

        let deadline = Instant::now() + READY_DEADLINE;
        loop {
            if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
                break;
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(Error::AppStart {
                    entry: entry.to_path_buf(),
                    message: format!("exited during startup with {status}"),
                });
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                return Err(Error::AppStart {
                    entry: entry.to_path_buf(),
                    message: format!("not listening on port {port} within {READY_DEADLINE:?}"),
                });
            }
            std::thread::sleep(READY_POLL);
        }

        *self.last_port.lock().unwrap() = Some(port);
        Ok(AppInstance {
            port,
            handle: Box::new(child),
        })
    }

    fn stop(&self, instance: AppInstance) {
        if let Ok(mut child) = instance.handle.downcast::<Child>() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// An ephemeral port the child can bind. Released before the child
/// starts; collisions in the gap are possible but rare enough for a
/// dev tool.
fn free_port() -> Result<u16, Error> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    Ok(port)
}
