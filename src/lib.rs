// Imageforge - image composition service
//
// Turns declarative blueprints (packages, modules, groups, and host
// customizations) into queued, reproducible image builds, exposed over an
// HTTP API.

pub mod api;
pub mod blueprint;
pub mod compose;
pub mod config;
pub mod customize;
pub mod queue;
pub mod resolver;
pub mod store;

// Re-export commonly used types
pub use api::{ApiError, AppState};
pub use blueprint::{Blueprint, BlueprintError, Customizations};
pub use compose::{start_build, BuilderConfig, ComposeError};
pub use config::{Config, ConfigError};
pub use queue::{BuildStatus, Queue, QueueError, Worker};
pub use resolver::{PackageNEVRA, ResolverError, ResolverHandle, Source, SourceStore};
pub use store::{BlueprintStore, StoreError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
