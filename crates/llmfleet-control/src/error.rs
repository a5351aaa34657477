use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use llmfleet_supervisor::{RegistryError, SpawnError, SupervisorError};

const MAX_MESSAGE_BYTES: usize = 8 * 1024;
const MAX_HINT_BYTES: usize = 2 * 1024;

/// JSON error body: `{code, message, hint?}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: Option<String>) -> Self {
        self.hint = hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES));
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

fn status_for(err: &SupervisorError) -> StatusCode {
    match err {
        SupervisorError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
        SupervisorError::Registry(_) | SupervisorError::AlreadyActive { .. } => {
            StatusCode::CONFLICT
        }
        SupervisorError::ProtectedInstance(_) => StatusCode::FORBIDDEN,
        SupervisorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SupervisorError::Spawn(SpawnError::ModelMissing { .. }) => StatusCode::BAD_REQUEST,
        SupervisorError::Spawn(SpawnError::PortBound { .. }) => StatusCode::CONFLICT,
        SupervisorError::Spawn(SpawnError::Io { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
        SupervisorError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        Self::new(status_for(&err), err.code(), err.to_string()).with_hint(err.hint())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use llmfleet_types::{InstanceId, InstanceStatus};

    use super::*;

    #[test]
    fn maps_supervisor_errors_to_status_codes() {
        let id = InstanceId::for_port(8001);
        let cases = [
            (
                SupervisorError::from(RegistryError::NotFound(id.clone())),
                StatusCode::NOT_FOUND,
            ),
            (
                SupervisorError::from(RegistryError::PortInUse {
                    port: 8001,
                    holder: id.clone(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                SupervisorError::ProtectedInstance(id.clone()),
                StatusCode::FORBIDDEN,
            ),
            (
                SupervisorError::AlreadyActive {
                    id: id.clone(),
                    status: InstanceStatus::Healthy,
                },
                StatusCode::CONFLICT,
            ),
            (
                SupervisorError::ResourceExhausted {
                    id: id.clone(),
                    available_bytes: 0,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SupervisorError::InvalidRequest("bad".to_string()),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            let code = err.code();
            let api = ApiError::from(err);
            assert_eq!(api.status, status, "{code}");
            assert_eq!(api.code, code);
        }
    }

    #[test]
    fn truncates_long_messages() {
        let api = ApiError::bad_request("é".repeat(MAX_MESSAGE_BYTES))
            .with_hint(Some("h".repeat(MAX_HINT_BYTES + 10)));
        assert!(api.message.len() <= MAX_MESSAGE_BYTES);
        assert!(api.message.ends_with("…(truncated)"));
        assert!(api.hint.unwrap().len() <= MAX_HINT_BYTES);
    }

    #[test]
    fn body_omits_status_and_empty_hint() {
        let v = serde_json::to_value(ApiError::bad_request("nope")).unwrap();
        assert_eq!(v, serde_json::json!({"code": "invalid_request", "message": "nope"}));
    }
}
