use chrono::{DateTime, Utc};

/// Stable instance identifier.
///
/// Derived from the port at creation time (`instance-8001`); the registry
/// appends a suffix when a record already holds that id.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn for_port(port: u16) -> Self {
        Self(format!("instance-{port}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Unstarted,
    Starting,
    Healthy,
    Offline,
    Stopping,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 5] = [
        InstanceStatus::Unstarted,
        InstanceStatus::Starting,
        InstanceStatus::Healthy,
        InstanceStatus::Offline,
        InstanceStatus::Stopping,
    ];

    /// States in which the instance owns a process and its port.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting | InstanceStatus::Healthy | InstanceStatus::Stopping
        )
    }

    /// Transition table for the instance lifecycle.
    ///
    /// Self-transitions are not listed; callers that want "no change" should
    /// not call into the registry at all.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Unstarted, Starting)
                | (Offline, Starting)
                | (Starting, Healthy)
                | (Offline, Healthy)
                | (Healthy, Offline)
                | (Starting, Stopping)
                | (Healthy, Stopping)
                | (Offline, Stopping)
                | (Stopping, Offline)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Unstarted => "unstarted",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Offline => "offline",
            InstanceStatus::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the most recent health probe applied to an instance.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HealthCheck {
    pub at: DateTime<Utc>,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
}

/// Point-in-time copy of an instance record. Never a live reference.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub port: u16,
    pub model_ref: Option<String>,
    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub pinned: bool,
    pub primary: bool,
    pub priority: i32,
    pub last_health_check: Option<HealthCheck>,
    pub consecutive_failures: u32,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(id: InstanceId, name: impl Into<String>, port: u16, model_ref: Option<String>) -> Self {
        Self {
            id,
            name: name.into(),
            port,
            model_ref,
            status: InstanceStatus::Unstarted,
            pid: None,
            pinned: false,
            primary: false,
            priority: 0,
            last_health_check: None,
            consecutive_failures: 0,
            message: None,
            created_at: Utc::now(),
            started_at: None,
        }
    }
}

/// Host resource sample. `None` means the platform could not provide the metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: Option<f32>,
    pub mem_percent: Option<f32>,
    pub mem_available_bytes: Option<u64>,
    pub mem_total_bytes: Option<u64>,
}

impl ResourceSample {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn is_unavailable(&self) -> bool {
        self.cpu_percent.is_none() && self.mem_percent.is_none() && self.mem_available_bytes.is_none()
    }
}
