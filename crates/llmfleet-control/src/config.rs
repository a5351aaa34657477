use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Context;
use llmfleet_supervisor::SupervisorConfig;

const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub primary_name: String,
    /// Model the controller reports as its own; also its `model_path` on `/health`.
    pub primary_model: Option<String>,
    /// Address announced on `/api/info`; detected when unset.
    pub advertise_ip: Option<String>,
    pub supervisor: SupervisorConfig,
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let bind = match lookup("LLMFLEET_BIND") {
            Some(raw) => raw
                .trim()
                .parse::<IpAddr>()
                .with_context(|| format!("invalid LLMFLEET_BIND: {raw}"))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let port = match lookup("LLMFLEET_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid LLMFLEET_PORT: {raw}"))?,
            None => DEFAULT_PORT,
        };
        let non_empty = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Self {
            bind,
            port,
            primary_name: non_empty("LLMFLEET_PRIMARY_NAME").unwrap_or_else(|| "Primary".to_string()),
            primary_model: non_empty("LLMFLEET_PRIMARY_MODEL"),
            advertise_ip: non_empty("LLMFLEET_ADVERTISE_IP"),
            supervisor: SupervisorConfig::from_lookup(&lookup)?,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// IP other hosts should use to reach this controller.
    pub fn advertised_ip(&self) -> String {
        if let Some(ip) = &self.advertise_ip {
            return ip.clone();
        }
        if !self.bind.is_unspecified() {
            return self.bind.to_string();
        }
        detect_local_ip().unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string())
    }
}

// Route lookup only; a UDP connect sends no packets.
fn detect_local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(10, 254, 254, 254), 1)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then(|| ip.to_string())
}
