pub mod backoff;
pub mod conflict;
pub mod discovery;
pub mod engine;
pub mod exclude;
pub mod item;
pub mod job;
pub mod journal;
pub mod local_walker;
pub mod local_watcher;
pub mod names;
pub mod observer;
pub mod paths;
pub mod planner;
pub mod propagator;
pub mod remote;
pub mod remote_walker;
pub mod transfer;
pub mod vfs;

#[cfg(test)]
pub mod memory_remote;
