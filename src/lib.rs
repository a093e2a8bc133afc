// Library module for cloudsync
// Re-exports modules for use by the agent binary and integration tests

pub mod config;
pub mod error;
pub mod fs;
pub mod logging;
pub mod sync;
