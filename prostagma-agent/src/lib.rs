mod client;
mod download;
mod logging;
mod poller;
mod script;
mod watch;

pub use client::{ClientError, CoordinatorClient, SourceOrigin};
pub use download::{CacheOrigin, ensure_file};
pub use logging::init as init_logging;
pub use poller::{Agent, AgentConfig, run_agent, spawn_agent};
pub use script::{BuildScript, DownloadStep, ScriptError, ShellStep, Step, run_build_script};
pub use watch::{PollOutcome, TriggerWatch};
