mod cache;
mod fetch;
mod server;
mod triggers;

pub use cache::CacheStore;
pub use fetch::{FetchError, Fetcher};
pub use server::{
    CoordinatorConfig, CoordinatorError, CoordinatorState, build_coordinator_app,
    default_cache_dir,
};
pub use triggers::TriggerStore;
