use std::time::Duration;

use anyhow::Context;
use llmfleet_types::InstanceId;

use crate::config::SupervisorConfig;

/// What to probe: a running instance and the pid it had when the probe was planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub id: InstanceId,
    pub port: u16,
    pub pid: u32,
}

/// Why a probe did not count as alive. Data, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    ConnectionRefused,
    BadStatus(u16),
    /// Endpoint answered, but not with `status: "healthy"`.
    Unhealthy(String),
    InvalidBody(String),
    Other(String),
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeFailure::Timeout => f.write_str("probe timed out"),
            ProbeFailure::ConnectionRefused => f.write_str("connection refused"),
            ProbeFailure::BadStatus(code) => write!(f, "health endpoint returned HTTP {code}"),
            ProbeFailure::Unhealthy(status) => write!(f, "instance reports status {status:?}"),
            ProbeFailure::InvalidBody(e) => write!(f, "invalid health body: {e}"),
            ProbeFailure::Other(e) => write!(f, "probe failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthResult {
    pub alive: bool,
    pub reported_model: Option<String>,
    pub resources: Option<serde_json::Value>,
    pub failure: Option<ProbeFailure>,
}

impl HealthResult {
    pub fn healthy(reported_model: Option<String>, resources: Option<serde_json::Value>) -> Self {
        Self {
            alive: true,
            reported_model,
            resources,
            failure: None,
        }
    }

    pub fn failed(failure: ProbeFailure) -> Self {
        Self {
            alive: false,
            reported_model: None,
            resources: None,
            failure: Some(failure),
        }
    }
}

/// One bounded liveness check against an instance's health endpoint.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> HealthResult;
}

#[derive(Debug, serde::Deserialize)]
struct HealthBody {
    status: String,
    #[serde(default)]
    model_path: Option<String>,
    #[serde(default)]
    resources: Option<serde_json::Value>,
}

/// `GET http://{host}:{port}/health` over reqwest.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    host: String,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("build health probe client")?;
        Ok(Self {
            client,
            host: "127.0.0.1".to_string(),
        })
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Probe aimed at the interface instances are told to bind.
    pub fn for_config(config: &SupervisorConfig) -> anyhow::Result<Self> {
        Ok(Self::new(config.probe_timeout)?.with_host(config.probe_host()))
    }

    pub fn url_for(&self, port: u16) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}/health", self.host, port)
        } else {
            format!("http://{}:{}/health", self.host, port)
        }
    }
}

fn classify(err: &reqwest::Error) -> ProbeFailure {
    if err.is_timeout() {
        ProbeFailure::Timeout
    } else if err.is_connect() {
        ProbeFailure::ConnectionRefused
    } else if err.is_decode() {
        ProbeFailure::InvalidBody(err.to_string())
    } else {
        ProbeFailure::Other(err.to_string())
    }
}

#[async_trait::async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, target: &ProbeTarget) -> HealthResult {
        let resp = match self.client.get(self.url_for(target.port)).send().await {
            Ok(r) => r,
            Err(e) => return HealthResult::failed(classify(&e)),
        };
        if !resp.status().is_success() {
            return HealthResult::failed(ProbeFailure::BadStatus(resp.status().as_u16()));
        }
        let body: HealthBody = match resp.json().await {
            Ok(b) => b,
            Err(e) => return HealthResult::failed(classify(&e)),
        };
        if body.status != "healthy" {
            return HealthResult::failed(ProbeFailure::Unhealthy(body.status));
        }
        HealthResult::healthy(body.model_path, body.resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Minimal one-shot HTTP responder on an ephemeral port.
    async fn serve_once(status_line: &'static str, body: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });
        port
    }

    fn target(port: u16) -> ProbeTarget {
        ProbeTarget {
            id: InstanceId::for_port(port),
            port,
            pid: 1,
        }
    }

    #[tokio::test]
    async fn healthy_body_is_alive() {
        let port = serve_once(
            "200 OK",
            r#"{"status":"healthy","model_path":"models/m1.gguf","resources":{"cpu":3}}"#,
        )
        .await;
        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let r = probe.probe(&target(port)).await;
        assert!(r.alive, "{r:?}");
        assert_eq!(r.reported_model.as_deref(), Some("models/m1.gguf"));
        assert_eq!(r.resources, Some(serde_json::json!({"cpu": 3})));
    }

    #[tokio::test]
    async fn non_healthy_status_is_dead() {
        let port = serve_once("200 OK", r#"{"status":"loading"}"#).await;
        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let r = probe.probe(&target(port)).await;
        assert!(!r.alive);
        assert_eq!(r.failure, Some(ProbeFailure::Unhealthy("loading".to_string())));
    }

    #[tokio::test]
    async fn http_error_is_dead() {
        let port = serve_once("503 Service Unavailable", r#"{"detail":"Model not loaded"}"#).await;
        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let r = probe.probe(&target(port)).await;
        assert_eq!(r.failure, Some(ProbeFailure::BadStatus(503)));
    }

    #[tokio::test]
    async fn refused_connection_is_dead() {
        let port = {
            let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
            l.local_addr().unwrap().port()
        };
        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let r = probe.probe(&target(port)).await;
        assert!(!r.alive);
        assert_eq!(r.failure, Some(ProbeFailure::ConnectionRefused));
    }

    #[test]
    fn urls_bracket_ipv6_hosts() {
        let probe = HttpProbe::new(Duration::from_secs(1)).unwrap();
        assert_eq!(probe.url_for(8001), "http://127.0.0.1:8001/health");
        let probe = probe.with_host("::1");
        assert_eq!(probe.url_for(8001), "http://[::1]:8001/health");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and hold the socket without answering.
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let probe = HttpProbe::new(Duration::from_millis(300)).unwrap();
        let r = probe.probe(&target(port)).await;
        assert_eq!(r.failure, Some(ProbeFailure::Timeout));
    }
}
