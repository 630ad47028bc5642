#![forbid(unsafe_code)]

pub mod cli;
pub mod clock;
pub mod compute;
pub mod config;
pub mod error;
pub mod lock;
pub mod logging;
pub mod markers;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod process;
pub mod scanner;
pub mod storage;
pub mod watchdog;

pub use config::BatchConfig;
pub use error::{BfError, BfResult};
pub use model::{BatchReport, PendingJob, RunStatus};
pub use orchestrator::Orchestrator;
pub use watchdog::{Watchdog, WatchdogVerdict};
