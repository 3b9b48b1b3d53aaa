pub mod agent;
pub mod config;
pub mod decision;
pub mod error;
pub mod events;
pub mod executor;
pub mod git;
pub mod issues;
pub mod lock;
pub mod log;
pub mod monitor;
pub mod pipeline;
pub mod preflight;
pub mod prompt;
pub mod scheduler;
pub mod store;
pub mod tmux;
pub mod tracker;
pub mod types;
