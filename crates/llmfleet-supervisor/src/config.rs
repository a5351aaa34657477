use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_MIN_AVAILABLE_MEM_BYTES: u64 = 512 * 1024 * 1024; // 512 MiB
const DEFAULT_CRITICAL_MEM_PERCENT: f32 = 95.0;

const DEFAULT_SERVER_CMD: &str = "llama-server";
const DEFAULT_SERVER_ARGS: &str = "--host {host} --port {port} --model {model}";

/// Which healthy instance gets paused when admission control needs memory back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Instance with the earliest `started_at` goes first.
    OldestStarted,
    /// Instance with the latest `started_at` goes first.
    NewestStarted,
    /// Lowest `priority` goes first; ties broken by oldest start.
    LowestPriority,
}

impl EvictionPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "oldest" | "oldest-started" | "oldest_started" => Some(EvictionPolicy::OldestStarted),
            "newest" | "newest-started" | "newest_started" => Some(EvictionPolicy::NewestStarted),
            "priority" | "lowest-priority" | "lowest_priority" => {
                Some(EvictionPolicy::LowestPriority)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AdmissionConfig {
    /// Below this much available memory a new start must evict first. 0 disables.
    pub min_available_bytes: u64,
    /// At or above this memory utilisation a new start must evict first.
    pub critical_mem_percent: f32,
    pub policy: EvictionPolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_available_bytes: DEFAULT_MIN_AVAILABLE_MEM_BYTES,
            critical_mem_percent: DEFAULT_CRITICAL_MEM_PERCENT,
            policy: EvictionPolicy::OldestStarted,
        }
    }
}

/// Command line used to launch one inference server.
///
/// `{host}`, `{port}`, `{model}` and `{id}` are substituted per instance.
#[derive(Clone, Debug)]
pub struct LaunchTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchTemplate {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn parse(program: &str, args: &str) -> Self {
        Self {
            program: program.trim().to_string(),
            args: args.split_whitespace().map(|s| s.to_string()).collect(),
        }
    }

    pub fn render(&self, host: &str, port: u16, model: &Path, id: &str) -> (String, Vec<String>) {
        let model = model.display().to_string();
        let port = port.to_string();
        let subst = |s: &str| {
            s.replace("{host}", host)
                .replace("{port}", &port)
                .replace("{model}", &model)
                .replace("{id}", id)
        };
        (
            subst(self.program.as_str()),
            self.args.iter().map(|a| subst(a.as_str())).collect(),
        )
    }
}

impl Default for LaunchTemplate {
    fn default() -> Self {
        Self::parse(DEFAULT_SERVER_CMD, DEFAULT_SERVER_ARGS)
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub launch: LaunchTemplate,
    /// Bind host handed to spawned servers.
    pub instance_host: String,
    pub models_dir: PathBuf,
    /// Working directory for spawned servers.
    pub work_dir: PathBuf,
    pub min_port: u16,
    /// Refuse to spawn when a foreign process already listens on the port.
    pub check_host_port: bool,
    pub probe_timeout: Duration,
    pub health_interval: Duration,
    pub failure_threshold: u32,
    pub startup_timeout: Duration,
    pub confirm_interval: Duration,
    pub stop_grace: Duration,
    pub admission: AdmissionConfig,
    pub log_max_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            launch: LaunchTemplate::default(),
            instance_host: "0.0.0.0".to_string(),
            models_dir: PathBuf::from("models"),
            work_dir: PathBuf::from("."),
            min_port: 1024,
            check_host_port: true,
            probe_timeout: Duration::from_secs(3),
            health_interval: Duration::from_secs(5),
            failure_threshold: 1,
            startup_timeout: Duration::from_secs(120),
            confirm_interval: Duration::from_millis(500),
            stop_grace: Duration::from_secs(10),
            admission: AdmissionConfig::default(),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
        }
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    min_ms: u64,
    max_ms: u64,
    default: Duration,
) -> Duration {
    parse_u64(lookup, name)
        .map(|v| Duration::from_millis(v.clamp(min_ms, max_ms)))
        .unwrap_or(default)
}

impl SupervisorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build a config from an arbitrary key lookup. Unknown or unparsable
    /// numeric values fall back to defaults; values are clamped to sane ranges.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let d = Self::default();

        let program = lookup("LLMFLEET_SERVER_CMD").unwrap_or_else(|| DEFAULT_SERVER_CMD.to_string());
        let args = lookup("LLMFLEET_SERVER_ARGS").unwrap_or_else(|| DEFAULT_SERVER_ARGS.to_string());
        let launch = LaunchTemplate::parse(&program, &args);
        if launch.program.is_empty() {
            anyhow::bail!("LLMFLEET_SERVER_CMD must be non-empty");
        }

        let policy = match lookup("LLMFLEET_EVICTION_POLICY") {
            Some(raw) => EvictionPolicy::parse(&raw)
                .with_context(|| format!("invalid LLMFLEET_EVICTION_POLICY: {raw}"))?,
            None => d.admission.policy,
        };

        let min_port = match lookup("LLMFLEET_MIN_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid LLMFLEET_MIN_PORT: {raw}"))?
                .max(1),
            None => d.min_port,
        };

        let critical_mem_percent = lookup("LLMFLEET_CRITICAL_MEM_PERCENT")
            .and_then(|v| v.trim().parse::<f32>().ok())
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(1.0, 100.0))
            .unwrap_or(d.admission.critical_mem_percent);

        Ok(Self {
            launch,
            instance_host: lookup("LLMFLEET_INSTANCE_HOST").unwrap_or(d.instance_host),
            models_dir: lookup("LLMFLEET_MODELS_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.models_dir),
            work_dir: lookup("LLMFLEET_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.work_dir),
            min_port,
            check_host_port: lookup("LLMFLEET_CHECK_HOST_PORT").is_none_or(|v| {
                !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
            }),
            probe_timeout: parse_millis(&lookup, "LLMFLEET_PROBE_TIMEOUT_MS", 250, 30_000, d.probe_timeout),
            health_interval: parse_millis(
                &lookup,
                "LLMFLEET_HEALTH_INTERVAL_MS",
                500,
                10 * 60 * 1000,
                d.health_interval,
            ),
            failure_threshold: parse_u64(&lookup, "LLMFLEET_HEALTH_FAILURE_THRESHOLD")
                .map(|v| v.clamp(1, 100) as u32)
                .unwrap_or(d.failure_threshold),
            startup_timeout: parse_millis(
                &lookup,
                "LLMFLEET_STARTUP_TIMEOUT_MS",
                1000,
                60 * 60 * 1000,
                d.startup_timeout,
            ),
            confirm_interval: parse_millis(
                &lookup,
                "LLMFLEET_CONFIRM_INTERVAL_MS",
                100,
                60_000,
                d.confirm_interval,
            ),
            stop_grace: parse_millis(&lookup, "LLMFLEET_STOP_GRACE_MS", 100, 5 * 60 * 1000, d.stop_grace),
            admission: AdmissionConfig {
                min_available_bytes: parse_u64(&lookup, "LLMFLEET_MIN_AVAILABLE_MEM_BYTES")
                    .unwrap_or(d.admission.min_available_bytes),
                critical_mem_percent,
                policy,
            },
            log_max_lines: parse_u64(&lookup, "LLMFLEET_LOG_MAX_LINES")
                .map(|v| (v as usize).clamp(100, 50_000))
                .unwrap_or(d.log_max_lines),
        })
    }

    /// Address health probes connect to. Wildcard binds are reached over loopback.
    pub fn probe_host(&self) -> String {
        match self.instance_host.trim() {
            "" | "0.0.0.0" | "::" | "[::]" => "127.0.0.1".to_string(),
            host => host.trim_start_matches('[').trim_end_matches(']').to_string(),
        }
    }

    /// Resolve a model reference against the models directory.
    pub fn resolve_model(&self, model_ref: &str) -> PathBuf {
        let p = Path::new(model_ref);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.models_dir.join(p)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = SupervisorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.launch.program, "llama-server");
        assert_eq!(cfg.failure_threshold, 1);
        assert_eq!(cfg.admission.policy, EvictionPolicy::OldestStarted);
        assert_eq!(cfg.instance_host, "0.0.0.0");
        assert!(cfg.check_host_port);
    }

    #[test]
    fn numeric_values_are_clamped() {
        let cfg = SupervisorConfig::from_lookup(lookup_from(&[
            ("LLMFLEET_PROBE_TIMEOUT_MS", "1"),
            ("LLMFLEET_HEALTH_FAILURE_THRESHOLD", "0"),
            ("LLMFLEET_CRITICAL_MEM_PERCENT", "250"),
        ]))
        .unwrap();
        assert_eq!(cfg.probe_timeout, Duration::from_millis(250));
        assert_eq!(cfg.failure_threshold, 1);
        assert_eq!(cfg.admission.critical_mem_percent, 100.0);
    }

    #[test]
    fn rejects_unknown_eviction_policy() {
        let err = SupervisorConfig::from_lookup(lookup_from(&[(
            "LLMFLEET_EVICTION_POLICY",
            "random",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("LLMFLEET_EVICTION_POLICY"));
    }

    #[test]
    fn parses_eviction_policy_aliases() {
        assert_eq!(
            EvictionPolicy::parse("Lowest-Priority"),
            Some(EvictionPolicy::LowestPriority)
        );
        assert_eq!(EvictionPolicy::parse("newest"), Some(EvictionPolicy::NewestStarted));
        assert_eq!(EvictionPolicy::parse(""), None);
    }

    #[test]
    fn launch_template_substitutes_placeholders() {
        let t = LaunchTemplate::default();
        let (program, args) = t.render("0.0.0.0", 8001, Path::new("/m/a.gguf"), "instance-8001");
        assert_eq!(program, "llama-server");
        assert_eq!(
            args,
            vec!["--host", "0.0.0.0", "--port", "8001", "--model", "/m/a.gguf"]
        );
    }

    #[test]
    fn probe_host_follows_instance_host() {
        let with_host = |host: &str| SupervisorConfig {
            instance_host: host.to_string(),
            ..SupervisorConfig::default()
        };
        assert_eq!(with_host("0.0.0.0").probe_host(), "127.0.0.1");
        assert_eq!(with_host("::").probe_host(), "127.0.0.1");
        assert_eq!(with_host("127.0.0.2").probe_host(), "127.0.0.2");
        assert_eq!(with_host("[::1]").probe_host(), "::1");
    }

    #[test]
    fn relative_models_resolve_under_models_dir() {
        let cfg = SupervisorConfig {
            models_dir: PathBuf::from("/srv/models"),
            ..Default::default()
        };
        assert_eq!(cfg.resolve_model("a.gguf"), PathBuf::from("/srv/models/a.gguf"));
        assert_eq!(cfg.resolve_model("/abs/b.gguf"), PathBuf::from("/abs/b.gguf"));
    }
}
