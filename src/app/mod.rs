pub mod adb;
pub mod automation;
pub mod config;
pub mod error;
pub mod ladder;
pub mod logging;
pub mod mirror;
pub mod models;
pub mod ports;
pub mod readiness;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod stream;
pub mod supervisor;
pub mod viewer;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
