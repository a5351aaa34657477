use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use llmfleet_types::{HealthCheck, Instance, InstanceId, InstanceStatus};
use tokio::sync::RwLock;

use crate::console::ConsoleLog;
use crate::error::RegistryError;
use crate::process::ProcessHandle;

#[derive(Debug)]
struct Entry {
    instance: Instance,
    handle: Option<ProcessHandle>,
    console: ConsoleLog,
}

impl Entry {
    fn snapshot(&self) -> Instance {
        self.instance.clone()
    }
}

type Table = HashMap<InstanceId, Entry>;

fn active_port_holder<'a>(
    table: &'a Table,
    port: u16,
    except: Option<&InstanceId>,
) -> Option<&'a InstanceId> {
    table
        .iter()
        .filter(|(id, _)| Some(*id) != except)
        .find(|(_, e)| e.instance.port == port && e.instance.status.is_active())
        .map(|(id, _)| id)
}

/// Authoritative in-memory table of instances.
///
/// Every method takes the lock once, mutates, and hands back a snapshot. The
/// lock is never held across I/O.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<RwLock<Table>>,
    log_max_lines: usize,
}

impl Registry {
    pub fn new(log_max_lines: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            log_max_lines,
        }
    }

    fn insert_locked(&self, table: &mut Table, instance: Instance) -> Result<Instance, RegistryError> {
        if table.contains_key(&instance.id) {
            return Err(RegistryError::DuplicateId(instance.id));
        }
        if let Some(holder) = active_port_holder(table, instance.port, None) {
            return Err(RegistryError::PortInUse {
                port: instance.port,
                holder: holder.clone(),
            });
        }
        let snapshot = instance.clone();
        table.insert(
            instance.id.clone(),
            Entry {
                instance,
                handle: None,
                console: ConsoleLog::new(self.log_max_lines),
            },
        );
        Ok(snapshot)
    }

    pub async fn insert(&self, instance: Instance) -> Result<Instance, RegistryError> {
        let mut table = self.inner.write().await;
        self.insert_locked(&mut table, instance)
    }

    /// Insert under a fresh id derived from the port (`instance-{port}`, then
    /// `instance-{port}-2`, ...). The incoming `id` is ignored.
    pub async fn insert_allocating(&self, mut instance: Instance) -> Result<Instance, RegistryError> {
        let mut table = self.inner.write().await;
        let base = InstanceId::for_port(instance.port);
        let mut candidate = base.clone();
        let mut n = 2u32;
        while table.contains_key(&candidate) {
            candidate = InstanceId(format!("{base}-{n}"));
            n = n.saturating_add(1);
        }
        instance.id = candidate;
        self.insert_locked(&mut table, instance)
    }

    pub async fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.inner.read().await.get(id).map(Entry::snapshot)
    }

    /// All records, oldest first.
    pub async fn list(&self) -> Vec<Instance> {
        let table = self.inner.read().await;
        let mut out: Vec<Instance> = table.values().map(Entry::snapshot).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub async fn port_holder(&self, port: u16, except: Option<&InstanceId>) -> Option<InstanceId> {
        let table = self.inner.read().await;
        active_port_holder(&table, port, except).cloned()
    }

    pub(crate) async fn handle(&self, id: &InstanceId) -> Option<ProcessHandle> {
        self.inner.read().await.get(id).and_then(|e| e.handle.clone())
    }

    pub(crate) async fn console(&self, id: &InstanceId) -> Option<ConsoleLog> {
        self.inner.read().await.get(id).map(|e| e.console.clone())
    }

    /// Move `id` to `status`, validated against the lifecycle table.
    ///
    /// Active states require a process handle: pass one when entering
    /// Starting, otherwise the current one is kept. Inactive states drop it.
    pub async fn update_status(
        &self,
        id: &InstanceId,
        status: InstanceStatus,
        handle: Option<ProcessHandle>,
    ) -> Result<Instance, RegistryError> {
        let mut table = self.inner.write().await;

        let from = table
            .get(id)
            .map(|e| e.instance.status)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        if !from.can_transition_to(status) {
            return Err(RegistryError::InvalidTransition {
                id: id.clone(),
                from,
                to: status,
            });
        }

        if status.is_active() && !from.is_active() {
            let port = table.get(id).map(|e| e.instance.port).unwrap_or_default();
            if let Some(holder) = active_port_holder(&table, port, Some(id)) {
                return Err(RegistryError::PortInUse {
                    port,
                    holder: holder.clone(),
                });
            }
        }

        let Some(entry) = table.get_mut(id) else {
            return Err(RegistryError::NotFound(id.clone()));
        };

        if status.is_active() {
            let has_handle = handle.is_some() || entry.handle.is_some();
            if !has_handle {
                return Err(RegistryError::InvalidTransition {
                    id: id.clone(),
                    from,
                    to: status,
                });
            }
            if let Some(h) = handle {
                entry.handle = Some(h);
            }
        } else {
            entry.handle = None;
        }

        entry.instance.status = status;
        entry.instance.pid = entry.handle.as_ref().map(|h| h.pid());
        if status == InstanceStatus::Starting {
            entry.instance.started_at = Some(Utc::now());
            entry.instance.consecutive_failures = 0;
        }
        Ok(entry.snapshot())
    }

    pub async fn remove(&self, id: &InstanceId) -> Result<Instance, RegistryError> {
        let mut table = self.inner.write().await;
        let entry = table
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        if entry.instance.status.is_active() {
            return Err(RegistryError::InstanceActive {
                id: id.clone(),
                status: entry.instance.status,
            });
        }
        table
            .remove(id)
            .map(|e| e.instance)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    /// Change port and/or model of an inactive record.
    pub async fn reconfigure(
        &self,
        id: &InstanceId,
        port: Option<u16>,
        model_ref: Option<String>,
    ) -> Result<Instance, RegistryError> {
        let mut table = self.inner.write().await;
        let status = table
            .get(id)
            .map(|e| e.instance.status)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        if status.is_active() {
            return Err(RegistryError::InstanceActive {
                id: id.clone(),
                status,
            });
        }
        if let Some(port) = port
            && let Some(holder) = active_port_holder(&table, port, Some(id))
        {
            return Err(RegistryError::PortInUse {
                port,
                holder: holder.clone(),
            });
        }

        let Some(entry) = table.get_mut(id) else {
            return Err(RegistryError::NotFound(id.clone()));
        };
        if let Some(port) = port {
            entry.instance.port = port;
        }
        if let Some(model_ref) = model_ref {
            entry.instance.model_ref = Some(model_ref);
        }
        Ok(entry.snapshot())
    }

    pub async fn rename(&self, id: &InstanceId, name: String) -> Result<Instance, RegistryError> {
        let mut table = self.inner.write().await;
        let entry = table
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        entry.instance.name = name;
        Ok(entry.snapshot())
    }

    /// Store a probe result; resets or bumps the consecutive failure counter.
    pub async fn record_health(
        &self,
        id: &InstanceId,
        check: HealthCheck,
    ) -> Result<Instance, RegistryError> {
        let mut table = self.inner.write().await;
        let entry = table
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        if check.alive {
            entry.instance.consecutive_failures = 0;
        } else {
            entry.instance.consecutive_failures =
                entry.instance.consecutive_failures.saturating_add(1);
        }
        entry.instance.last_health_check = Some(check);
        Ok(entry.snapshot())
    }

    pub async fn set_message(&self, id: &InstanceId, message: Option<String>) -> Option<Instance> {
        let mut table = self.inner.write().await;
        let entry = table.get_mut(id)?;
        entry.instance.message = message;
        Some(entry.snapshot())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::process::LaunchSpec;

    fn record(port: u16) -> Instance {
        Instance::new(InstanceId::for_port(port), format!("Instance {port}"), port, Some("m1".into()))
    }

    fn sleeper() -> ProcessHandle {
        let spec = LaunchSpec::new("sleep", vec!["30".to_string()], ".");
        ProcessHandle::spawn(&spec, ConsoleLog::new(10)).unwrap()
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let reg = Registry::new(100);
        reg.insert(record(8001)).await.unwrap();
        let err = reg.insert(record(8001)).await.unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId(InstanceId::for_port(8001)));
    }

    #[tokio::test]
    async fn allocating_insert_suffixes_taken_ids() {
        let reg = Registry::new(100);
        let a = reg.insert_allocating(record(8001)).await.unwrap();
        let b = reg.insert_allocating(record(8001)).await.unwrap();
        let c = reg.insert_allocating(record(8001)).await.unwrap();
        assert_eq!(a.id.as_str(), "instance-8001");
        assert_eq!(b.id.as_str(), "instance-8001-2");
        assert_eq!(c.id.as_str(), "instance-8001-3");
        assert_eq!(reg.list().await.len(), 3);
    }

    #[tokio::test]
    async fn insert_rejects_port_held_by_active_instance() {
        let reg = Registry::new(100);
        let a = reg.insert(record(8001)).await.unwrap();
        let h = sleeper();
        reg.update_status(&a.id, InstanceStatus::Starting, Some(h.clone()))
            .await
            .unwrap();

        let err = reg.insert_allocating(record(8001)).await.unwrap_err();
        assert!(matches!(err, RegistryError::PortInUse { port: 8001, .. }));
        assert_eq!(reg.list().await.len(), 1);

        h.terminate(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn snapshots_are_detached_copies() {
        let reg = Registry::new(100);
        let a = reg.insert(record(8001)).await.unwrap();
        let mut snap = reg.get(&a.id).await.unwrap();
        snap.name = "changed".to_string();
        assert_eq!(reg.get(&a.id).await.unwrap().name, "Instance 8001");
    }

    #[tokio::test]
    async fn handle_follows_status() {
        let reg = Registry::new(100);
        let a = reg.insert(record(8002)).await.unwrap();

        // Entering an active state without a handle is refused.
        let err = reg
            .update_status(&a.id, InstanceStatus::Starting, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        let h = sleeper();
        let s = reg
            .update_status(&a.id, InstanceStatus::Starting, Some(h.clone()))
            .await
            .unwrap();
        assert_eq!(s.pid, Some(h.pid()));
        assert!(s.started_at.is_some());

        let s = reg.update_status(&a.id, InstanceStatus::Healthy, None).await.unwrap();
        assert_eq!(s.pid, Some(h.pid()));

        let s = reg.update_status(&a.id, InstanceStatus::Stopping, None).await.unwrap();
        assert_eq!(s.pid, Some(h.pid()));
        h.terminate(Duration::from_secs(5)).await;

        let s = reg.update_status(&a.id, InstanceStatus::Offline, None).await.unwrap();
        assert_eq!(s.pid, None);
        assert!(reg.handle(&a.id).await.is_none());
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let reg = Registry::new(100);
        let a = reg.insert(record(8003)).await.unwrap();
        for to in [InstanceStatus::Healthy, InstanceStatus::Stopping, InstanceStatus::Offline] {
            let err = reg.update_status(&a.id, to, None).await.unwrap_err();
            assert_eq!(
                err,
                RegistryError::InvalidTransition {
                    id: a.id.clone(),
                    from: InstanceStatus::Unstarted,
                    to,
                }
            );
        }
        assert_eq!(reg.get(&a.id).await.unwrap().status, InstanceStatus::Unstarted);
    }

    #[tokio::test]
    async fn starting_rechecks_port_exclusivity() {
        let reg = Registry::new(100);
        let a = reg.insert(record(8004)).await.unwrap();
        let b = reg
            .insert(Instance::new("other".into(), "other", 8004, Some("m2".into())))
            .await
            .unwrap();

        let ha = sleeper();
        reg.update_status(&a.id, InstanceStatus::Starting, Some(ha.clone()))
            .await
            .unwrap();

        let hb = sleeper();
        let err = reg
            .update_status(&b.id, InstanceStatus::Starting, Some(hb.clone()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::PortInUse {
                port: 8004,
                holder: a.id.clone()
            }
        );
        assert_eq!(reg.get(&b.id).await.unwrap().status, InstanceStatus::Unstarted);
        assert!(reg.handle(&b.id).await.is_none());

        ha.terminate(Duration::from_secs(5)).await;
        hb.terminate(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn remove_refuses_active_instances() {
        let reg = Registry::new(100);
        let a = reg.insert(record(8005)).await.unwrap();
        let h = sleeper();
        reg.update_status(&a.id, InstanceStatus::Starting, Some(h.clone()))
            .await
            .unwrap();

        let err = reg.remove(&a.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::InstanceActive { .. }));

        reg.update_status(&a.id, InstanceStatus::Stopping, None).await.unwrap();
        h.terminate(Duration::from_secs(5)).await;
        reg.update_status(&a.id, InstanceStatus::Offline, None).await.unwrap();
        reg.remove(&a.id).await.unwrap();
        assert!(reg.get(&a.id).await.is_none());
        assert_eq!(
            reg.remove(&a.id).await.unwrap_err(),
            RegistryError::NotFound(a.id.clone())
        );
    }

    #[tokio::test]
    async fn health_records_count_consecutive_failures() {
        let reg = Registry::new(100);
        let a = reg.insert(record(8006)).await.unwrap();
        let check = |alive| HealthCheck {
            at: Utc::now(),
            alive,
            detail: None,
            reported_model: None,
            resources: None,
        };
        reg.record_health(&a.id, check(false)).await.unwrap();
        let s = reg.record_health(&a.id, check(false)).await.unwrap();
        assert_eq!(s.consecutive_failures, 2);
        let s = reg.record_health(&a.id, check(true)).await.unwrap();
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.last_health_check.unwrap().alive);
    }

    #[tokio::test]
    async fn reconfigure_only_while_inactive() {
        let reg = Registry::new(100);
        let a = reg.insert(record(8007)).await.unwrap();
        let s = reg
            .reconfigure(&a.id, Some(8008), Some("m2".to_string()))
            .await
            .unwrap();
        assert_eq!(s.port, 8008);
        assert_eq!(s.model_ref.as_deref(), Some("m2"));
        assert_eq!(s.id, a.id);
    }
}
