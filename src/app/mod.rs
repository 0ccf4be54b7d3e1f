pub mod adb;
pub mod cancel;
pub mod commands;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod models;
pub mod pairing;
pub mod quick_connect;
pub mod registry;
pub mod scheduler;
pub mod state;

#[cfg(test)]
pub mod test_support;
