pub mod chronometer;
pub mod cluster;
pub mod config;
pub mod database;
pub mod executors;
pub mod health;
pub mod job;
pub mod pipeline;
pub mod process;
pub mod provision;
pub mod reconciler;
pub mod shutdown;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod testing;
