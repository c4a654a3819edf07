#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

pub mod app;
pub mod bundle;
pub mod config;
pub mod error;
pub mod gateway;
pub mod mock;
pub mod patch;
pub mod reload;
pub mod resolver;
pub mod transform;
pub mod watch;

pub use app::{AppInstance, AppLifecycle, AppSupervisor};
pub use bundle::{Bundler, BundlerOptions};
pub use config::GatewayConfig;
pub use error::Error;
pub use gateway::{router, GatewayState};
pub use mock::{MockOutcome, MockRegistry};
pub use patch::ResponsePatcher;
pub use reload::{ReloadBroadcaster, ReloadMessage};
pub use resolver::Resolver;
pub use transform::{TransformCache, Transformer};
pub use watch::{WatchCoordinator, WatchSet};
