use llmfleet_types::{InstanceId, InstanceStatus};

/// OS-level failure to bring up an instance process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("model file not found: {path}")]
    ModelMissing { path: String },
    #[error("port {port} is already bound on this host")]
    PortBound { port: u16 },
    #[error("failed to spawn `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl SpawnError {
    pub fn hint(&self) -> Option<String> {
        match self {
            SpawnError::ModelMissing { .. } => {
                Some("Place the model file under the models directory or pass an absolute path.".to_string())
            }
            SpawnError::PortBound { .. } => Some(
                "Another process on this host is listening on the port; pick another port."
                    .to_string(),
            ),
            SpawnError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => Some(
                "Check LLMFLEET_SERVER_CMD points at an installed inference server binary."
                    .to_string(),
            ),
            SpawnError::Io { source, .. }
                if source.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                Some("The inference server binary is not executable by this user.".to_string())
            }
            SpawnError::Io { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("instance already exists: {0}")]
    DuplicateId(InstanceId),
    #[error("port {port} is in use by {holder}")]
    PortInUse { port: u16, holder: InstanceId },
    #[error("unknown instance: {0}")]
    NotFound(InstanceId),
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
    },
    #[error("instance {id} is {status}; stop it first")]
    InstanceActive { id: InstanceId, status: InstanceStatus },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("instance {id} is already {status}")]
    AlreadyActive { id: InstanceId, status: InstanceStatus },
    #[error("instance {0} hosts the control API and cannot be stopped or removed")]
    ProtectedInstance(InstanceId),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(
        "insufficient memory to start {id} and no running instance can be paused (available {available_bytes} bytes)"
    )]
    ResourceExhausted { id: InstanceId, available_bytes: u64 },
    #[error("{0}")]
    InvalidRequest(String),
}

impl SupervisorError {
    /// Stable machine-readable code for API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::Registry(RegistryError::DuplicateId(_)) => "duplicate_id",
            SupervisorError::Registry(RegistryError::PortInUse { .. }) => "port_in_use",
            SupervisorError::Registry(RegistryError::NotFound(_)) => "not_found",
            SupervisorError::Registry(RegistryError::InvalidTransition { .. }) => {
                "invalid_transition"
            }
            SupervisorError::Registry(RegistryError::InstanceActive { .. }) => "instance_active",
            SupervisorError::AlreadyActive { .. } => "already_active",
            SupervisorError::ProtectedInstance(_) => "protected_instance",
            SupervisorError::Spawn(_) => "spawn_failed",
            SupervisorError::ResourceExhausted { .. } => "resource_exhausted",
            SupervisorError::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            SupervisorError::Registry(RegistryError::PortInUse { .. }) => {
                Some("Pick another port, or stop the instance holding it.".to_string())
            }
            SupervisorError::Registry(RegistryError::InstanceActive { .. }) => {
                Some("Stop the instance before removing it.".to_string())
            }
            SupervisorError::Spawn(e) => e.hint(),
            SupervisorError::ResourceExhausted { .. } => Some(
                "Stop an instance manually, unpin one, or lower LLMFLEET_MIN_AVAILABLE_MEM_BYTES."
                    .to_string(),
            ),
            _ => None,
        }
    }
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
