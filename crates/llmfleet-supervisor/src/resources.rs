use llmfleet_types::ResourceSample;
use sysinfo::System;
use tokio::sync::Mutex;

/// Point-in-time host resource sampling for admission decisions.
#[async_trait::async_trait]
pub trait ResourceSampler: Send + Sync {
    /// Best effort: metrics the platform cannot provide come back as `None`.
    async fn sample(&self) -> ResourceSample;
}

/// Host sampler backed by `sysinfo`.
#[derive(Debug)]
pub struct SystemMonitor {
    sys: Mutex<System>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ResourceSampler for SystemMonitor {
    async fn sample(&self) -> ResourceSample {
        let mut sys = self.sys.lock().await;

        // CPU usage is a delta between two refreshes.
        sys.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_percent = if sys.cpus().is_empty() {
            None
        } else {
            Some(sys.global_cpu_usage()).filter(|v| v.is_finite())
        };

        let total = sys.total_memory();
        let available = sys.available_memory();
        let (mem_percent, mem_available_bytes, mem_total_bytes) = if total == 0 {
            (None, None, None)
        } else {
            let used = total.saturating_sub(available);
            let pct = (used as f64 / total as f64 * 100.0) as f32;
            (Some(pct), Some(available), Some(total))
        };

        ResourceSample {
            cpu_percent,
            mem_percent,
            mem_available_bytes,
            mem_total_bytes,
        }
    }
}

/// Fixed sample, for tests and for hosts where admission control is disabled.
#[derive(Debug, Default)]
pub struct StaticSampler {
    sample: std::sync::Mutex<ResourceSample>,
}

impl StaticSampler {
    pub fn new(sample: ResourceSample) -> Self {
        Self {
            sample: std::sync::Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: ResourceSample) {
        if let Ok(mut s) = self.sample.lock() {
            *s = sample;
        }
    }
}

#[async_trait::async_trait]
impl ResourceSampler for StaticSampler {
    async fn sample(&self) -> ResourceSample {
        self.sample.lock().map(|s| *s).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_sample_is_self_consistent() {
        let s = SystemMonitor::new().sample().await;
        if let (Some(avail), Some(total)) = (s.mem_available_bytes, s.mem_total_bytes) {
            assert!(avail <= total);
        }
        if let Some(pct) = s.mem_percent {
            assert!((0.0..=100.0).contains(&pct));
        }
    }

    #[tokio::test]
    async fn static_sampler_can_be_updated() {
        let s = StaticSampler::new(ResourceSample::unavailable());
        assert!(s.sample().await.is_unavailable());
        s.set(ResourceSample {
            mem_available_bytes: Some(42),
            ..Default::default()
        });
        assert_eq!(s.sample().await.mem_available_bytes, Some(42));
    }
}
