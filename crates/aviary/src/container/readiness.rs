//! Startup readiness flow.
//!
//! Before any agent container can be started the host must have a
//! reachable container runtime and the agent image locally available.
//! [`ReadinessCheck::run`] walks that ladder once and publishes each
//! state transition, so a UI can show "starting Docker", "pulling
//! image 40%" and the like instead of a generic spinner.

use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use aviary_protocol::events::{ReadinessEvent, ReadinessState};

use super::error::ContainerError;
use super::{ContainerRuntimeApi, PullProgress};

const READINESS_CHANNEL_CAPACITY: usize = 64;

/// How long to wait after asking a daemon to start before re-checking.
const DAEMON_START_GRACE: Duration = Duration::from_secs(3);
const DAEMON_START_ATTEMPTS: u32 = 5;

/// Progress publications are throttled to once per second unless the
/// percentage advanced by at least this many points.
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_secs(1);
const PROGRESS_MIN_DELTA: u8 = 5;

#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Image every agent container runs.
    pub image: String,
    /// When set, a missing image is built from this directory instead
    /// of pulled from a registry.
    pub build_context: Option<String>,
}

/// One-shot readiness ladder with observable progress.
pub struct ReadinessCheck {
    config: ReadinessConfig,
    events_tx: broadcast::Sender<ReadinessEvent>,
}

impl ReadinessCheck {
    pub fn new(config: ReadinessConfig) -> Self {
        let (events_tx, _) = broadcast::channel(READINESS_CHANNEL_CAPACITY);
        Self { config, events_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReadinessEvent> {
        self.events_tx.subscribe()
    }

    fn publish(&self, state: ReadinessState, message: impl Into<String>) {
        self.publish_progress(state, message, None);
    }

    fn publish_progress(
        &self,
        state: ReadinessState,
        message: impl Into<String>,
        pull_progress: Option<u8>,
    ) {
        let _ = self.events_tx.send(ReadinessEvent {
            state,
            message: Some(message.into()),
            pull_progress,
        });
    }

    /// Walk the readiness ladder. `fallback` is an alternate runtime
    /// to try when the primary's daemon cannot be reached (e.g.
    /// podman when Docker Desktop is not running).
    pub async fn run(
        &self,
        primary: Arc<dyn ContainerRuntimeApi>,
        fallback: Option<Arc<dyn ContainerRuntimeApi>>,
    ) -> (ReadinessState, Option<Arc<dyn ContainerRuntimeApi>>) {
        self.publish(ReadinessState::Checking, "checking container runtime");

        let Some(runtime) = self.reachable_runtime(primary, fallback).await else {
            let message = "no reachable container runtime; start Docker Desktop \
                           or install podman, then retry";
            self.publish(ReadinessState::RuntimeUnavailable, message);
            return (ReadinessState::RuntimeUnavailable, None);
        };

        match runtime.image_exists(&self.config.image).await {
            Ok(true) => {
                self.publish(ReadinessState::Ready, "image present");
                return (ReadinessState::Ready, Some(runtime));
            }
            Ok(false) => {}
            Err(err) => {
                let message = format!("image inspection failed: {err}");
                self.publish(ReadinessState::Error, message);
                return (ReadinessState::Error, None);
            }
        }

        let outcome = if let Some(ref context) = self.config.build_context {
            self.publish_progress(
                ReadinessState::PullingImage,
                format!("building {}", self.config.image),
                None,
            );
            runtime.build_image(&self.config.image, context).await
        } else {
            self.pull_with_progress(runtime.as_ref()).await
        };

        match outcome {
            Ok(()) => {
                info!("image {} is ready", self.config.image);
                self.publish(ReadinessState::Ready, "image ready");
                (ReadinessState::Ready, Some(runtime))
            }
            Err(err) => {
                warn!("image acquisition failed: {err}");
                let message = match err {
                    ContainerError::ImageNotFound(image) => format!(
                        "image '{image}' could not be pulled; check the image \
                         name and registry access"
                    ),
                    other => format!("image acquisition failed: {other}"),
                };
                self.publish(ReadinessState::Error, message);
                (ReadinessState::Error, None)
            }
        }
    }

    async fn reachable_runtime(
        &self,
        primary: Arc<dyn ContainerRuntimeApi>,
        fallback: Option<Arc<dyn ContainerRuntimeApi>>,
    ) -> Option<Arc<dyn ContainerRuntimeApi>> {
        for runtime in std::iter::once(primary).chain(fallback) {
            if runtime.daemon_reachable().await.is_ok() {
                return Some(runtime);
            }
            // The daemon may just not be started yet.
            runtime.try_start_daemon().await;
            for attempt in 1..=DAEMON_START_ATTEMPTS {
                tokio::time::sleep(DAEMON_START_GRACE).await;
                match runtime.daemon_reachable().await {
                    Ok(()) => return Some(runtime),
                    Err(err) if attempt == DAEMON_START_ATTEMPTS => {
                        warn!("runtime daemon unreachable: {err}");
                    }
                    Err(_) => {}
                }
            }
        }
        None
    }

    async fn pull_with_progress(
        &self,
        runtime: &dyn ContainerRuntimeApi,
    ) -> Result<(), ContainerError> {
        self.publish_progress(
            ReadinessState::PullingImage,
            format!("pulling {}", self.config.image),
            Some(0),
        );

        let events_tx = self.events_tx.clone();
        let image = self.config.image.clone();
        let last: Mutex<(Instant, u8)> = Mutex::new((Instant::now(), 0));
        let callback = move |progress: PullProgress| {
            let percent = (progress.fraction() * 100.0).round().clamp(0.0, 100.0) as u8;
            let mut last = match last.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let (published_at, published_percent) = *last;
            if published_at.elapsed() < PROGRESS_MIN_INTERVAL
                && percent.saturating_sub(published_percent) < PROGRESS_MIN_DELTA
            {
                return;
            }
            *last = (Instant::now(), percent);
            let _ = events_tx.send(ReadinessEvent {
                state: ReadinessState::PullingImage,
                message: Some(format!("pulling {image}: {percent}%")),
                pull_progress: Some(percent),
            });
        };

        runtime
            .pull_image(&self.config.image, Some(Box::new(callback)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::config::{ContainerConfig, ContainerStats};
    use super::super::error::ContainerResult;
    use super::super::ContainerState;
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ScriptedRuntime {
        reachable: AtomicBool,
        has_image: AtomicBool,
        pull_ok: bool,
        pulls: AtomicUsize,
    }

    impl ScriptedRuntime {
        fn new(reachable: bool, has_image: bool, pull_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                reachable: AtomicBool::new(reachable),
                has_image: AtomicBool::new(has_image),
                pull_ok,
                pulls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ContainerRuntimeApi for ScriptedRuntime {
        async fn run(&self, _config: &ContainerConfig) -> ContainerResult<String> {
            Ok("id".to_string())
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
            Ok(None)
        }

        async fn stats(&self, _name: &str) -> ContainerResult<ContainerStats> {
            Err(ContainerError::ParseError("not scripted".to_string()))
        }

        async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
            Ok(self.has_image.load(Ordering::SeqCst))
        }

        async fn pull_image(
            &self,
            image: &str,
            progress: Option<Box<dyn Fn(PullProgress) + Send + Sync>>,
        ) -> ContainerResult<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            if let Some(callback) = progress {
                callback(PullProgress {
                    layers_seen: 2,
                    layers_done: 1,
                });
                callback(PullProgress {
                    layers_seen: 2,
                    layers_done: 2,
                });
            }
            if self.pull_ok {
                self.has_image.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(ContainerError::ImageNotFound(image.to_string()))
            }
        }

        async fn build_image(&self, _image: &str, _context_dir: &str) -> ContainerResult<()> {
            Ok(())
        }

        async fn daemon_reachable(&self) -> ContainerResult<()> {
            if self.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ContainerError::DaemonUnreachable("scripted".to_string()))
            }
        }

        async fn try_start_daemon(&self) {
            // Pretend the start request worked.
            self.reachable.store(true, Ordering::SeqCst);
        }
    }

    fn check() -> ReadinessCheck {
        ReadinessCheck::new(ReadinessConfig {
            image: "aviary/agent:latest".to_string(),
            build_context: None,
        })
    }

    fn drain(rx: &mut broadcast::Receiver<ReadinessEvent>) -> Vec<ReadinessEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn image_present_goes_straight_to_ready() {
        let runtime = ScriptedRuntime::new(true, true, true);
        let checker = check();
        let mut rx = checker.subscribe();

        let (state, selected) = checker.run(runtime, None).await;
        assert_eq!(state, ReadinessState::Ready);
        assert!(selected.is_some());
        let states: Vec<_> = drain(&mut rx).into_iter().map(|e| e.state).collect();
        assert_eq!(states, vec![ReadinessState::Checking, ReadinessState::Ready]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_daemon_is_started_then_used() {
        let runtime = ScriptedRuntime::new(false, true, true);
        let checker = check();

        let (state, _) = checker.run(runtime, None).await;
        assert_eq!(state, ReadinessState::Ready);
    }

    #[tokio::test]
    async fn missing_image_is_pulled_with_progress() {
        let runtime = ScriptedRuntime::new(true, false, true);
        let checker = check();
        let mut rx = checker.subscribe();

        let (state, _) = checker.run(runtime.clone(), None).await;
        assert_eq!(state, ReadinessState::Ready);
        assert_eq!(runtime.pulls.load(Ordering::SeqCst), 1);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| e.state == ReadinessState::PullingImage && e.pull_progress == Some(0)));
        assert_eq!(events.last().map(|e| e.state), Some(ReadinessState::Ready));
    }

    #[tokio::test]
    async fn failed_pull_is_terminal_with_remediation() {
        let runtime = ScriptedRuntime::new(true, false, false);
        let checker = check();
        let mut rx = checker.subscribe();

        let (state, selected) = checker.run(runtime, None).await;
        assert_eq!(state, ReadinessState::Error);
        assert!(selected.is_none());
        let last = drain(&mut rx).pop().unwrap();
        assert!(last.message.unwrap().contains("could not be pulled"));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_alternate_runtime() {
        struct DeadRuntime;

        #[async_trait]
        impl ContainerRuntimeApi for DeadRuntime {
            async fn run(&self, _config: &ContainerConfig) -> ContainerResult<String> {
                Err(ContainerError::NoRuntimeAvailable)
            }
            async fn start(&self, _name: &str) -> ContainerResult<()> {
                Err(ContainerError::NoRuntimeAvailable)
            }
            async fn stop(&self, _name: &str, _grace_secs: u32) -> ContainerResult<()> {
                Err(ContainerError::NoRuntimeAvailable)
            }
            async fn remove(&self, _name: &str) -> ContainerResult<()> {
                Err(ContainerError::NoRuntimeAvailable)
            }
            async fn state(&self, _name: &str) -> ContainerResult<ContainerState> {
                Err(ContainerError::NoRuntimeAvailable)
            }
            async fn host_port(
                &self,
                _name: &str,
                _container_port: u16,
            ) -> ContainerResult<Option<u16>> {
                Err(ContainerError::NoRuntimeAvailable)
            }
            async fn stats(&self, _name: &str) -> ContainerResult<ContainerStats> {
                Err(ContainerError::NoRuntimeAvailable)
            }
            async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
                Err(ContainerError::NoRuntimeAvailable)
            }
            async fn pull_image(
                &self,
                _image: &str,
                _progress: Option<Box<dyn Fn(PullProgress) + Send + Sync>>,
            ) -> ContainerResult<()> {
                Err(ContainerError::NoRuntimeAvailable)
            }
            async fn build_image(&self, _image: &str, _context_dir: &str) -> ContainerResult<()> {
                Err(ContainerError::NoRuntimeAvailable)
            }
            async fn daemon_reachable(&self) -> ContainerResult<()> {
                Err(ContainerError::DaemonUnreachable("dead".to_string()))
            }
        }

        let fallback = ScriptedRuntime::new(true, true, true);
        let checker = check();
        let (state, selected) = checker
            .run(Arc::new(DeadRuntime), Some(fallback))
            .await;
        assert_eq!(state, ReadinessState::Ready);
        assert!(selected.is_some());
    }
}
