use std::time::Duration;

use futures_util::future::join_all;
use llmfleet_types::{InstanceId, InstanceStatus};
use tokio::task::JoinHandle;

use crate::health::ProbeTarget;
use crate::supervisor::{HealthApplied, Supervisor};

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub probed: usize,
    pub outcomes: Vec<(InstanceId, HealthApplied)>,
}

impl ReconcileReport {
    pub fn changed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| !matches!(o, HealthApplied::Unchanged | HealthApplied::Stale))
            .count()
    }
}

/// Periodic health sweep over every running instance.
///
/// Clients never trigger probes; they read whatever status the last sweep
/// left in the registry.
#[derive(Debug, Clone)]
pub struct HealthReconciler {
    supervisor: Supervisor,
    interval: Duration,
}

impl HealthReconciler {
    pub fn new(supervisor: Supervisor) -> Self {
        let interval = supervisor.config().health_interval;
        Self {
            supervisor,
            interval,
        }
    }

    /// Probe all Starting/Healthy instances concurrently and apply the results.
    pub async fn reconcile_all(&self) -> ReconcileReport {
        let targets: Vec<ProbeTarget> = self
            .supervisor
            .list_instances()
            .await
            .into_iter()
            .filter(|i| matches!(i.status, InstanceStatus::Starting | InstanceStatus::Healthy))
            .filter_map(|i| {
                i.pid.map(|pid| ProbeTarget {
                    id: i.id,
                    port: i.port,
                    pid,
                })
            })
            .collect();

        let sweeps = targets.iter().map(|target| async move {
            let result = self.supervisor.probe_bounded(target).await;
            let applied = match self.supervisor.apply_health(&target.id, target.pid, result).await {
                Ok(applied) => applied,
                Err(e) => {
                    tracing::warn!(id = %target.id, error = %e, "failed to apply health result");
                    HealthApplied::Stale
                }
            };
            (target.id.clone(), applied)
        });
        let outcomes = join_all(sweeps).await;

        ReconcileReport {
            probed: targets.len(),
            outcomes,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_ms = self.interval.as_millis() as u64, "health reconciler started");
            loop {
                let report = self.reconcile_all().await;
                if report.changed() > 0 {
                    tracing::debug!(
                        probed = report.probed,
                        changed = report.changed(),
                        "health sweep applied transitions"
                    );
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::supervisor::tests::{supervisor_with, test_config, wait_status};
    use crate::supervisor::{CreateRequest, StartOverrides};

    async fn running(sup: &Supervisor, port: u16) -> InstanceId {
        let inst = sup
            .create_instance(CreateRequest {
                port,
                model_ref: Some("m1.gguf".to_string()),
                ..CreateRequest::default()
            })
            .await
            .unwrap();
        sup.start_instance(&inst.id, StartOverrides::default())
            .await
            .unwrap();
        inst.id
    }

    #[tokio::test]
    async fn hanging_probe_does_not_delay_others() {
        let mut config = test_config();
        // Keep the confirmation task out of the way.
        config.confirm_interval = Duration::from_secs(60);
        config.probe_timeout = Duration::from_millis(300);
        let (sup, probe, _) = supervisor_with(config);

        let slow = running(&sup, 18101).await;
        let fast = running(&sup, 18102).await;
        probe.set_hang(18101);
        probe.set_alive(18102, true);

        let reconciler = HealthReconciler::new(sup.clone());
        let started = tokio::time::Instant::now();
        let report = reconciler.reconcile_all().await;
        let elapsed = started.elapsed();

        assert_eq!(report.probed, 2);
        assert!(elapsed < Duration::from_secs(3), "sweep took {elapsed:?}");
        assert!(
            report
                .outcomes
                .contains(&(fast.clone(), HealthApplied::BecameHealthy))
        );
        assert!(report.outcomes.contains(&(slow.clone(), HealthApplied::Unchanged)));

        let slow_check = sup.get_instance(&slow).await.unwrap().last_health_check.unwrap();
        assert!(!slow_check.alive);
        assert_eq!(slow_check.detail.as_deref(), Some("probe timed out"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_takes_crashed_instance_offline() {
        let (sup, probe, _) = supervisor_with(test_config());
        probe.set_alive(18103, true);
        let id = running(&sup, 18103).await;
        wait_status(&sup, &id, InstanceStatus::Healthy).await;

        let handle = sup.registry().handle(&id).await.unwrap();
        probe.set_alive(18103, false);
        unsafe {
            libc::kill(handle.pid() as i32, libc::SIGKILL);
        }
        assert!(handle.wait_exit(Duration::from_secs(5)).await);

        let report = HealthReconciler::new(sup.clone()).reconcile_all().await;
        assert_eq!(report.changed(), 1);
        let after = sup.get_instance(&id).await.unwrap();
        assert_eq!(after.status, InstanceStatus::Offline);

        // Offline instances are not probed.
        let report = HealthReconciler::new(sup.clone()).reconcile_all().await;
        assert_eq!(report.probed, 0);
    }

    #[tokio::test]
    async fn background_loop_confirms_instances() {
        let mut config = test_config();
        config.confirm_interval = Duration::from_secs(60);
        config.health_interval = Duration::from_millis(50);
        let (sup, probe, _) = supervisor_with(config);
        let id = running(&sup, 18104).await;
        probe.set_alive(18104, true);

        let task = HealthReconciler::new(sup.clone()).spawn();
        wait_status(&sup, &id, InstanceStatus::Healthy).await;
        task.abort();
        sup.shutdown().await;
    }
}
