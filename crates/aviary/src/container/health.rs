//! Periodic health checks for running agent containers.
//!
//! Each check inspects one aspect of a container and reports an
//! [`HealthStatus`]. Results are published as [`HealthEvent`]s, but
//! only when a check's status changed since the last round, so a
//! container that stays degraded does not flood the stream.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use aviary_protocol::events::{ContainerStatus, HealthCheckResult, HealthEvent, HealthStatus};

use super::manager::ContainerManager;

const HEALTH_CHANNEL_CAPACITY: usize = 256;

/// Memory pressure thresholds as percentages of the container limit.
#[derive(Debug, Clone, Copy)]
pub struct MemoryThresholds {
    pub warning_percent: f64,
    pub critical_percent: f64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warning_percent: 85.0,
            critical_percent: 95.0,
        }
    }
}

/// One health check over a single agent container.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Stable name used for deduplication and display.
    fn name(&self) -> &'static str;

    async fn check(&self, manager: &ContainerManager, slug: &str) -> HealthCheckResult;
}

/// Memory usage check backed by `stats --no-stream`.
pub struct MemoryChecker {
    thresholds: MemoryThresholds,
}

impl MemoryChecker {
    pub fn new(thresholds: MemoryThresholds) -> Self {
        Self { thresholds }
    }
}

#[async_trait]
impl HealthChecker for MemoryChecker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check(&self, manager: &ContainerManager, slug: &str) -> HealthCheckResult {
        let stats = match manager.stats(slug).await {
            Ok(stats) => stats,
            Err(err) => {
                return HealthCheckResult {
                    check: self.name().to_string(),
                    status: HealthStatus::Warning,
                    message: format!("stats unavailable: {err}"),
                    details: None,
                };
            }
        };
        let Some(percent) = stats.memory_percent() else {
            return HealthCheckResult {
                check: self.name().to_string(),
                status: HealthStatus::Warning,
                message: format!("unparseable memory figure '{}'", stats.mem_percent),
                details: None,
            };
        };
        let status = if percent >= self.thresholds.critical_percent {
            HealthStatus::Critical
        } else if percent >= self.thresholds.warning_percent {
            HealthStatus::Warning
        } else {
            HealthStatus::Ok
        };
        HealthCheckResult {
            check: self.name().to_string(),
            status,
            message: format!("memory at {percent:.1}% ({})", stats.mem_usage),
            details: Some(serde_json::json!({ "percent": percent })),
        }
    }
}

/// Runs every registered checker against every tracked agent on an
/// interval.
pub struct HealthMonitor {
    manager: Arc<ContainerManager>,
    checkers: Vec<Box<dyn HealthChecker>>,
    // Last published status per (agent, check), for dedup.
    last_seen: Mutex<HashMap<(String, String), HealthStatus>>,
    events_tx: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<ContainerManager>, checkers: Vec<Box<dyn HealthChecker>>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        Arc::new(Self {
            manager,
            checkers,
            last_seen: Mutex::new(HashMap::new()),
            events_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events_tx.subscribe()
    }

    /// One round over all running agents. Returns the events that
    /// were actually published.
    pub async fn run_round(&self) -> Vec<HealthEvent> {
        let mut published = Vec::new();
        for slug in self.manager.tracked_agents() {
            if self.manager.status(&slug) != Some(ContainerStatus::Running) {
                continue;
            }
            let mut changed = Vec::new();
            for checker in &self.checkers {
                let result = checker.check(&self.manager, &slug).await;
                let key = (slug.clone(), result.check.clone());
                let mut last_seen = self.last_seen.lock().await;
                let is_new = last_seen.get(&key) != Some(&result.status);
                if is_new {
                    if result.status != HealthStatus::Ok {
                        warn!("agent {slug} health {}: {}", result.check, result.message);
                    } else {
                        debug!("agent {slug} health {} recovered", result.check);
                    }
                    last_seen.insert(key, result.status);
                    changed.push(result);
                }
            }
            if !changed.is_empty() {
                let event = HealthEvent {
                    agent_slug: slug,
                    checks: changed,
                    checked_at: Utc::now(),
                };
                let _ = self.events_tx.send(event.clone());
                published.push(event);
            }
        }
        published
    }

    /// Forget dedup state for an agent, e.g. after its container was
    /// recreated.
    pub async fn reset_agent(&self, slug: &str) {
        self.last_seen.lock().await.retain(|(s, _), _| s != slug);
    }

    pub fn spawn_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                monitor.run_round().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::config::{ContainerConfig, ContainerStats};
    use super::super::error::ContainerResult;
    use super::super::manager::ManagerConfig;
    use super::super::{ContainerRuntimeApi, ContainerState, PullProgress};
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Runtime whose single container is always running and reports a
    /// scripted memory percentage.
    struct StatsRuntime {
        mem_percent: StdMutex<String>,
    }

    impl StatsRuntime {
        fn new(percent: &str) -> Arc<Self> {
            Arc::new(Self {
                mem_percent: StdMutex::new(percent.to_string()),
            })
        }

        fn set_percent(&self, percent: &str) {
            *self.mem_percent.lock().unwrap() = percent.to_string();
        }
    }

    #[async_trait]
    impl ContainerRuntimeApi for StatsRuntime {
        async fn run(&self, _config: &ContainerConfig) -> ContainerResult<String> {
            Ok("deadbeefcafe".to_string())
        }

        async fn start(&self, _name: &str) -> ContainerResult<()> {
            Ok(())
        }

        async fn stop(&self, _name: &str, _grace_secs: u32) -> ContainerResult<()> {
            Ok(())
        }

        async fn remove(&self, _name: &str) -> ContainerResult<()> {
            Ok(())
        }

        async fn state(&self, _name: &str) -> ContainerResult<ContainerState> {
            Ok(ContainerState::Running)
        }

        async fn host_port(
            &self,
            _name: &str,
            _container_port: u16,
        ) -> ContainerResult<Option<u16>> {
            Ok(Some(32768))
        }

        async fn stats(&self, name: &str) -> ContainerResult<ContainerStats> {
            Ok(ContainerStats {
                container_id: "deadbeefcafe".to_string(),
                name: name.to_string(),
                cpu_percent: "1.0%".to_string(),
                mem_usage: "1GiB / 2GiB".to_string(),
                mem_percent: self.mem_percent.lock().unwrap().clone(),
                pids: "8".to_string(),
            })
        }

        async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
            Ok(true)
        }

        async fn pull_image(
            &self,
            _image: &str,
            _progress: Option<Box<dyn Fn(PullProgress) + Send + Sync>>,
        ) -> ContainerResult<()> {
            Ok(())
        }

        async fn build_image(&self, _image: &str, _context_dir: &str) -> ContainerResult<()> {
            Ok(())
        }

        async fn daemon_reachable(&self) -> ContainerResult<()> {
            Ok(())
        }
    }

    async fn monitor_with(runtime: Arc<StatsRuntime>) -> Arc<HealthMonitor> {
        let manager = ContainerManager::new(runtime, ManagerConfig::default());
        manager
            .ensure_running("research", HashMap::new())
            .await
            .unwrap();
        HealthMonitor::new(
            manager,
            vec![Box::new(MemoryChecker::new(MemoryThresholds::default()))],
        )
    }

    #[tokio::test]
    async fn classifies_memory_pressure() {
        let runtime = StatsRuntime::new("96.2%");
        let monitor = monitor_with(runtime).await;

        let events = monitor.run_round().await;
        assert_eq!(events.len(), 1);
        let check = &events[0].checks[0];
        assert_eq!(check.status, HealthStatus::Critical);
        assert!(check.message.contains("96.2"));
    }

    #[tokio::test]
    async fn unchanged_status_is_published_once() {
        let runtime = StatsRuntime::new("90.0%");
        let monitor = monitor_with(runtime.clone()).await;

        assert_eq!(monitor.run_round().await.len(), 1);
        // Same status next round: deduped.
        assert_eq!(monitor.run_round().await.len(), 0);

        // Recovery is a transition and gets published.
        runtime.set_percent("40.0%");
        let events = monitor.run_round().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].checks[0].status, HealthStatus::Ok);
    }

    #[tokio::test]
    async fn reset_clears_dedup_state() {
        let runtime = StatsRuntime::new("90.0%");
        let monitor = monitor_with(runtime).await;

        assert_eq!(monitor.run_round().await.len(), 1);
        monitor.reset_agent("research").await;
        assert_eq!(monitor.run_round().await.len(), 1);
    }
}
