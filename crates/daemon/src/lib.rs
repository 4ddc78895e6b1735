// Service modules (node functionality)
pub mod ledger_store;
pub mod pipeline;
pub mod process;
pub mod service_config;
pub mod service_state;
pub mod supervisor;

// App state (configuration, paths)
pub mod state;

// Re-exports for consumers
pub use process::{spawn_service, start_service, try_start_service, ShutdownHandle, StartError};
pub use service_config::Config as ServiceConfig;
pub use service_state::State as ServiceState;
pub use state::{AppConfig, AppState, StateError};
