use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use futures_util::future::join_all;
use llmfleet_types::{HealthCheck, Instance, InstanceId, InstanceStatus, ResourceSample};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::{EvictionPolicy, SupervisorConfig};
use crate::error::{RegistryError, Result, SpawnError, SupervisorError};
use crate::health::{HealthProbe, HealthResult, HttpProbe, ProbeFailure, ProbeTarget};
use crate::port_check;
use crate::process::{LaunchSpec, ProcessHandle, TerminateOutcome};
use crate::registry::Registry;
use crate::resources::{ResourceSampler, SystemMonitor};

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: Option<String>,
    pub port: u16,
    pub model_ref: Option<String>,
    pub pinned: bool,
    pub priority: i32,
}

/// Port/model changes applied before a start; only allowed while inactive.
#[derive(Debug, Clone, Default)]
pub struct StartOverrides {
    pub port: Option<u16>,
    pub model_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub instance: Instance,
    /// Healthy instance that was stopped to make room, if any.
    pub evicted: Option<InstanceId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    AlreadyStopped,
    Terminated(TerminateOutcome),
}

#[derive(Debug, Clone)]
pub struct StopOutcome {
    pub instance: Instance,
    pub result: StopResult,
}

/// What a probe result did to the instance it was taken for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthApplied {
    Unchanged,
    BecameHealthy,
    StartFailed { reason: String },
    WentOffline { reason: String },
    /// The instance was restarted, stopped or removed after the probe was planned.
    Stale,
}

struct Inner {
    config: SupervisorConfig,
    registry: Registry,
    sampler: Arc<dyn ResourceSampler>,
    probe: Arc<dyn HealthProbe>,
    op_locks: std::sync::Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
}

/// Lifecycle policy over the registry and the processes behind it.
///
/// Operations on the same instance id run one at a time; different ids
/// proceed in parallel.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

fn is_evictable(i: &Instance, starting: &InstanceId) -> bool {
    i.status == InstanceStatus::Healthy && !i.pinned && !i.primary && &i.id != starting
}

fn exit_reason(handle: Option<&ProcessHandle>) -> String {
    match handle.and_then(|h| h.exit_info()) {
        Some(info) => format!("process exited ({info})"),
        None => "process exited".to_string(),
    }
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        sampler: Arc<dyn ResourceSampler>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let registry = Registry::new(config.log_max_lines);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                sampler,
                probe,
                op_locks: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Host sampler and HTTP probe.
    pub fn with_defaults(config: SupervisorConfig) -> anyhow::Result<Self> {
        let probe = HttpProbe::for_config(&config)?;
        Ok(Self::new(config, Arc::new(SystemMonitor::new()), Arc::new(probe)))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub async fn sample_resources(&self) -> ResourceSample {
        self.inner.sampler.sample().await
    }

    async fn op_lock(&self, id: &InstanceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .inner
                .op_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            locks.entry(id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    // Called with the id's own guard held. The entry stays while anyone else
    // still waits on it, so waiters and newcomers keep sharing one mutex.
    fn forget_op_lock(&self, id: &InstanceId) {
        let mut locks = self
            .inner
            .op_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) <= 2) {
            locks.remove(id);
        }
    }

    pub async fn list_instances(&self) -> Vec<Instance> {
        self.inner.registry.list().await
    }

    pub async fn get_instance(&self, id: &InstanceId) -> Result<Instance> {
        self.inner
            .registry
            .get(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.clone()).into())
    }

    fn validate_port(&self, port: u16) -> Result<()> {
        let min = self.inner.config.min_port;
        if port < min {
            return Err(SupervisorError::InvalidRequest(format!(
                "port must be between {min} and 65535"
            )));
        }
        Ok(())
    }

    pub async fn create_instance(&self, req: CreateRequest) -> Result<Instance> {
        self.validate_port(req.port)?;
        let name = req
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Instance {}", req.port));
        let model_ref = req.model_ref.filter(|m| !m.trim().is_empty());

        let mut instance = Instance::new(InstanceId::for_port(req.port), name, req.port, model_ref);
        instance.pinned = req.pinned;
        instance.priority = req.priority;

        let created = self.inner.registry.insert_allocating(instance).await?;
        tracing::info!(id = %created.id, port = created.port, "instance created");
        Ok(created)
    }

    pub async fn start_instance(
        &self,
        id: &InstanceId,
        overrides: StartOverrides,
    ) -> Result<StartOutcome> {
        let _guard = self.op_lock(id).await;
        let registry = &self.inner.registry;
        let config = &self.inner.config;

        let mut current = self.get_instance(id).await?;
        if current.status.is_active() {
            return Err(SupervisorError::AlreadyActive {
                id: id.clone(),
                status: current.status,
            });
        }

        if let Some(port) = overrides.port {
            self.validate_port(port)?;
        }
        let model_override = overrides.model_ref.filter(|m| !m.trim().is_empty());
        let port_changed = overrides.port.is_some_and(|p| p != current.port);
        let model_changed = model_override
            .as_ref()
            .is_some_and(|m| current.model_ref.as_ref() != Some(m));
        if port_changed || model_changed {
            current = registry
                .reconfigure(id, overrides.port, model_override)
                .await?;
        }

        let Some(model_ref) = current.model_ref.clone() else {
            return Err(SupervisorError::InvalidRequest(format!(
                "instance {id} has no model; pass one to start it"
            )));
        };
        let model_path = config.resolve_model(&model_ref);
        if !tokio::fs::try_exists(&model_path).await.unwrap_or(false) {
            let err = SpawnError::ModelMissing {
                path: model_path.display().to_string(),
            };
            registry.set_message(id, Some(err.to_string())).await;
            return Err(err.into());
        }

        let port = current.port;
        if let Some(holder) = registry.port_holder(port, Some(id)).await {
            return Err(RegistryError::PortInUse { port, holder }.into());
        }

        let evicted = self.admit(&current).await?;

        if config.check_host_port
            && let Err(e) = port_check::ensure_host_port_free(&config.instance_host, port)
        {
            registry.set_message(id, Some(e.to_string())).await;
            return Err(e.into());
        }

        let (program, args) =
            config
                .launch
                .render(&config.instance_host, port, &model_path, id.as_str());
        let spec = LaunchSpec::new(program, args, config.work_dir.clone());
        let console = registry
            .console(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        console
            .emit(format!("[llmfleet] starting: {}", spec.command_line()))
            .await;

        let handle = match ProcessHandle::spawn(&spec, console.clone()) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(%id, error = %e, "instance spawn failed");
                console.emit(format!("[llmfleet] spawn failed: {e}")).await;
                registry.set_message(id, Some(e.to_string())).await;
                return Err(e.into());
            }
        };

        if let Err(e) = registry
            .update_status(id, InstanceStatus::Starting, Some(handle.clone()))
            .await
        {
            handle.terminate(config.stop_grace).await;
            return Err(e.into());
        }

        let pid = handle.pid();
        let message = match &evicted {
            Some(victim) => format!("starting (pid {pid}); paused {victim} to free memory"),
            None => format!("starting (pid {pid})"),
        };
        let instance = registry
            .set_message(id, Some(message))
            .await
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        tracing::info!(%id, pid, port, model = %model_ref, "instance starting");

        self.spawn_confirmation(id.clone(), pid);
        Ok(StartOutcome { instance, evicted })
    }

    fn under_pressure(&self, sample: &ResourceSample) -> bool {
        let a = &self.inner.config.admission;
        let low_available = a.min_available_bytes > 0
            && sample
                .mem_available_bytes
                .is_some_and(|b| b < a.min_available_bytes);
        let high_percent = sample
            .mem_percent
            .is_some_and(|p| p >= a.critical_mem_percent);
        low_available || high_percent
    }

    async fn pick_victim(&self, starting: &InstanceId, passed_over: &[InstanceId]) -> Option<InstanceId> {
        let mut candidates: Vec<Instance> = self
            .inner
            .registry
            .list()
            .await
            .into_iter()
            .filter(|i| is_evictable(i, starting) && !passed_over.contains(&i.id))
            .collect();
        let started = |i: &Instance| i.started_at.unwrap_or(i.created_at);
        match self.inner.config.admission.policy {
            EvictionPolicy::OldestStarted => candidates.sort_by_key(started),
            EvictionPolicy::NewestStarted => {
                candidates.sort_by_key(|i| std::cmp::Reverse(started(i)))
            }
            EvictionPolicy::LowestPriority => candidates.sort_by_key(|i| (i.priority, started(i))),
        }
        candidates.into_iter().next().map(|i| i.id)
    }

    /// Admission control for `candidate`. Evicts at most one instance.
    async fn admit(&self, candidate: &Instance) -> Result<Option<InstanceId>> {
        let sample = self.inner.sampler.sample().await;
        if !self.under_pressure(&sample) {
            return Ok(None);
        }

        // The victim list is a snapshot; each pick is rechecked under its own lock.
        let mut passed_over = Vec::new();
        loop {
            let Some(victim) = self.pick_victim(&candidate.id, &passed_over).await else {
                tracing::warn!(id = %candidate.id, ?sample, "admission refused; nothing to evict");
                return Err(SupervisorError::ResourceExhausted {
                    id: candidate.id.clone(),
                    available_bytes: sample.mem_available_bytes.unwrap_or(0),
                });
            };

            let _guard = self.op_lock(&victim).await;
            let still_evictable = self
                .inner
                .registry
                .get(&victim)
                .await
                .is_some_and(|i| is_evictable(&i, &candidate.id));
            if !still_evictable {
                tracing::debug!(id = %candidate.id, %victim, "eviction candidate changed state; picking again");
                passed_over.push(victim);
                continue;
            }

            tracing::warn!(id = %candidate.id, %victim, ?sample, "memory pressure; pausing instance");
            self.stop_locked(&victim, format!("paused to free memory for {}", candidate.id))
                .await?;
            return Ok(Some(victim));
        }
    }

    pub async fn stop_instance(&self, id: &InstanceId) -> Result<StopOutcome> {
        let _guard = self.op_lock(id).await;
        self.stop_locked(id, "stopped".to_string()).await
    }

    async fn stop_locked(&self, id: &InstanceId, reason: String) -> Result<StopOutcome> {
        let registry = &self.inner.registry;
        let current = self.get_instance(id).await?;
        if current.primary {
            return Err(SupervisorError::ProtectedInstance(id.clone()));
        }

        match current.status {
            InstanceStatus::Unstarted | InstanceStatus::Offline => {
                return Ok(StopOutcome {
                    instance: current,
                    result: StopResult::AlreadyStopped,
                });
            }
            InstanceStatus::Starting | InstanceStatus::Healthy => {
                registry
                    .update_status(id, InstanceStatus::Stopping, None)
                    .await?;
            }
            InstanceStatus::Stopping => {}
        }

        let outcome = match registry.handle(id).await {
            Some(handle) => handle.terminate(self.inner.config.stop_grace).await,
            None => TerminateOutcome::AlreadyExited,
        };
        if let Some(console) = registry.console(id).await {
            console
                .emit(format!("[llmfleet] stopped ({outcome:?})"))
                .await;
        }

        registry
            .update_status(id, InstanceStatus::Offline, None)
            .await?;
        let instance = registry
            .set_message(id, Some(reason))
            .await
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        tracing::info!(%id, ?outcome, "instance stopped");
        Ok(StopOutcome {
            instance,
            result: StopResult::Terminated(outcome),
        })
    }

    pub async fn remove_instance(&self, id: &InstanceId) -> Result<Instance> {
        let _guard = self.op_lock(id).await;
        let current = self.get_instance(id).await?;
        if current.primary {
            return Err(SupervisorError::ProtectedInstance(id.clone()));
        }
        let removed = self.inner.registry.remove(id).await?;
        self.forget_op_lock(id);
        tracing::info!(%id, "instance removed");
        Ok(removed)
    }

    pub async fn rename_instance(&self, id: &InstanceId, name: &str) -> Result<Instance> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SupervisorError::InvalidRequest(
                "name must be non-empty".to_string(),
            ));
        }
        let _guard = self.op_lock(id).await;
        Ok(self.inner.registry.rename(id, name.to_string()).await?)
    }

    /// Record the controller process itself as a running, pinned instance.
    pub async fn register_primary(
        &self,
        name: &str,
        port: u16,
        model_ref: Option<String>,
    ) -> Result<Instance> {
        let mut instance = Instance::new(InstanceId::for_port(port), name, port, model_ref);
        instance.primary = true;
        instance.pinned = true;
        let id = self.inner.registry.insert(instance).await?.id;

        let _guard = self.op_lock(&id).await;
        let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
        let handle = ProcessHandle::attached(std::process::id(), cmdline);
        let registry = &self.inner.registry;
        registry
            .update_status(&id, InstanceStatus::Starting, Some(handle))
            .await?;
        let instance = registry
            .update_status(&id, InstanceStatus::Healthy, None)
            .await?;
        tracing::info!(%id, port, "registered controller as primary instance");
        Ok(instance)
    }

    pub async fn instance_logs(
        &self,
        id: &InstanceId,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<String>, u64)> {
        let console = self
            .inner
            .registry
            .console(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        Ok(console.tail(cursor, limit).await)
    }

    /// One probe, bounded by the configured probe timeout.
    pub async fn probe_bounded(&self, target: &ProbeTarget) -> HealthResult {
        tokio::time::timeout(self.inner.config.probe_timeout, self.inner.probe.probe(target))
            .await
            .unwrap_or_else(|_| HealthResult::failed(ProbeFailure::Timeout))
    }

    /// Turn a probe result into a state transition. `pid` is the process the
    /// probe was planned for; results for any other process are dropped.
    pub async fn apply_health(
        &self,
        id: &InstanceId,
        pid: u32,
        result: HealthResult,
    ) -> Result<HealthApplied> {
        let _guard = self.op_lock(id).await;
        let registry = &self.inner.registry;
        let config = &self.inner.config;

        let Some(current) = registry.get(id).await else {
            return Ok(HealthApplied::Stale);
        };
        if current.pid != Some(pid)
            || !matches!(
                current.status,
                InstanceStatus::Starting | InstanceStatus::Healthy
            )
        {
            return Ok(HealthApplied::Stale);
        }

        let check = HealthCheck {
            at: Utc::now(),
            alive: result.alive,
            detail: result.failure.as_ref().map(ToString::to_string),
            reported_model: result.reported_model,
            resources: result.resources,
        };
        let recorded = registry.record_health(id, check).await?;
        if current.primary {
            return Ok(HealthApplied::Unchanged);
        }

        let handle = registry.handle(id).await;
        let process_alive = handle.as_ref().is_some_and(ProcessHandle::is_alive);

        match (current.status, result.alive) {
            (InstanceStatus::Starting, true) => {
                registry
                    .update_status(id, InstanceStatus::Healthy, None)
                    .await?;
                registry.set_message(id, None).await;
                tracing::info!(%id, pid, "instance healthy");
                Ok(HealthApplied::BecameHealthy)
            }
            (InstanceStatus::Starting, false) => {
                let reason = if !process_alive {
                    format!("{} during startup", exit_reason(handle.as_ref()))
                } else if current.started_at.is_some_and(|t| {
                    (Utc::now() - t).to_std().unwrap_or_default() >= config.startup_timeout
                }) {
                    format!(
                        "did not become healthy within {}s",
                        config.startup_timeout.as_secs()
                    )
                } else {
                    return Ok(HealthApplied::Unchanged);
                };
                self.fail_start(id, handle.as_ref(), &reason).await?;
                Ok(HealthApplied::StartFailed { reason })
            }
            (InstanceStatus::Healthy, false) => {
                let reason = if !process_alive {
                    format!("{} unexpectedly", exit_reason(handle.as_ref()))
                } else if recorded.consecutive_failures >= config.failure_threshold {
                    if let Some(h) = &handle {
                        h.terminate(config.stop_grace).await;
                    }
                    format!(
                        "unresponsive after {} failed health checks",
                        recorded.consecutive_failures
                    )
                } else {
                    return Ok(HealthApplied::Unchanged);
                };
                registry
                    .update_status(id, InstanceStatus::Offline, None)
                    .await?;
                registry.set_message(id, Some(reason.clone())).await;
                tracing::warn!(%id, pid, %reason, "instance went offline");
                Ok(HealthApplied::WentOffline { reason })
            }
            _ => Ok(HealthApplied::Unchanged),
        }
    }

    async fn fail_start(
        &self,
        id: &InstanceId,
        handle: Option<&ProcessHandle>,
        reason: &str,
    ) -> Result<()> {
        let registry = &self.inner.registry;
        registry
            .update_status(id, InstanceStatus::Stopping, None)
            .await?;
        if let Some(h) = handle {
            h.terminate(self.inner.config.stop_grace).await;
        }
        registry
            .update_status(id, InstanceStatus::Offline, None)
            .await?;
        registry.set_message(id, Some(reason.to_string())).await;
        if let Some(console) = registry.console(id).await {
            console.emit(format!("[llmfleet] start failed: {reason}")).await;
        }
        tracing::warn!(%id, %reason, "instance failed to start");
        Ok(())
    }

    // Probes a freshly started instance until it is healthy, its process
    // dies, or the startup deadline passes.
    fn spawn_confirmation(&self, id: InstanceId, pid: u32) {
        let sup = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sup.inner.config.confirm_interval).await;
                let Some(current) = sup.inner.registry.get(&id).await else {
                    return;
                };
                if current.pid != Some(pid) || current.status != InstanceStatus::Starting {
                    return;
                }
                let target = ProbeTarget {
                    id: id.clone(),
                    port: current.port,
                    pid,
                };
                let result = sup.probe_bounded(&target).await;
                match sup.apply_health(&id, pid, result).await {
                    Ok(HealthApplied::Unchanged) => {}
                    Ok(_) => return,
                    Err(e) => {
                        tracing::warn!(%id, error = %e, "start confirmation aborted");
                        return;
                    }
                }
            }
        });
    }

    /// Stop every running instance this controller spawned.
    pub async fn shutdown(&self) {
        let running: Vec<InstanceId> = self
            .list_instances()
            .await
            .into_iter()
            .filter(|i| i.status.is_active() && !i.primary)
            .map(|i| i.id)
            .collect();
        if running.is_empty() {
            return;
        }
        tracing::info!(count = running.len(), "stopping instances");
        let results = join_all(running.iter().map(|id| self.stop_instance(id))).await;
        for (id, res) in running.iter().zip(results) {
            if let Err(e) = res {
                tracing::warn!(%id, error = %e, "failed to stop instance during shutdown");
            }
        }
    }
}
