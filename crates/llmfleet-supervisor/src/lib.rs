pub mod config;
pub mod console;
pub mod error;
pub mod health;
pub mod models;
pub mod port_check;
pub mod process;
pub mod reconciler;
pub mod registry;
pub mod resources;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use error::{RegistryError, SpawnError, SupervisorError};
pub use health::{HealthProbe, HealthResult, HttpProbe, ProbeFailure, ProbeTarget};
pub use reconciler::{HealthReconciler, ReconcileReport};
pub use supervisor::{
    CreateRequest, HealthApplied, StartOutcome, StartOverrides, StopOutcome, StopResult,
    Supervisor,
};
