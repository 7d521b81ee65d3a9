// Re-export modules for library use
pub mod config;
pub mod connection_manager;
pub mod orchestrator;
pub mod shutdown;
