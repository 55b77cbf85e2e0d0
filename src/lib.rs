pub mod config;
pub mod exec;
pub mod gateway;
pub mod git;
pub mod hooks;
pub mod identity;
pub mod patterns;
pub mod protect;
pub mod sparse;
pub mod workflow;

/// Initialise stderr logging at `info`, overridable through `RUST_LOG`.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
