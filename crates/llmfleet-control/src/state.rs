use std::sync::Arc;

use llmfleet_supervisor::Supervisor;
use llmfleet_types::InstanceId;

/// Facts about this controller reported on `/api/info` and `/health`.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub ip: String,
    pub hostname: String,
    pub port: u16,
    pub primary: Option<InstanceId>,
    pub model_path: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub info: Arc<ServerInfo>,
}

impl AppState {
    pub fn new(supervisor: Supervisor, info: ServerInfo) -> Self {
        Self {
            supervisor,
            info: Arc::new(info),
        }
    }
}
