pub mod cli;
pub mod config;
pub mod decoder;
pub mod derived;
pub mod meter;
pub mod metrics;
pub mod orchestrator;
pub mod scheduler;
pub mod sink;
pub mod weather;
