pub mod audit;
pub mod classifier;
pub mod config;
pub mod db;
pub mod ecosystem;
pub mod error;
pub mod exec;
pub mod git;
pub mod pipeline;
pub mod pr_host;
pub mod repo_lock;
pub mod scheduler;
pub mod smart_scheduler;
pub mod types;
pub mod wakeup;
pub mod workspace;

pub use types::*;
