//! Container runtime wrapper.
//!
//! Shells out to the `docker` or `podman` CLI rather than speaking to
//! the daemon socket directly, so the same code path works for both
//! runtimes and for rootless podman. All inputs are validated before
//! they reach the command line.

pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod readiness;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

pub use config::{ContainerConfig, ContainerStats, PortMapping};
pub use error::{ContainerError, ContainerResult};
pub use manager::{ContainerManager, ManagerConfig};

use config::{validate_container_name, validate_image_name};

/// Which container runtime CLI to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeType {
    Docker,
    Podman,
}

impl RuntimeType {
    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    pub fn alternate(&self) -> RuntimeType {
        match self {
            RuntimeType::Docker => RuntimeType::Podman,
            RuntimeType::Podman => RuntimeType::Docker,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

impl std::str::FromStr for RuntimeType {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(RuntimeType::Docker),
            "podman" => Ok(RuntimeType::Podman),
            other => Err(ContainerError::InvalidInput(format!(
                "unknown runtime '{other}' (expected docker or podman)"
            ))),
        }
    }
}

/// Lifecycle state reported by `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Created,
    Paused,
    Unknown,
}

impl ContainerState {
    fn parse(status: &str) -> Self {
        match status.trim() {
            "running" => ContainerState::Running,
            "exited" | "stopped" | "dead" => ContainerState::Exited,
            "created" | "configured" => ContainerState::Created,
            "paused" => ContainerState::Paused,
            _ => ContainerState::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

/// Image pull progress, derived from the CLI's layer output.
#[derive(Debug, Clone, Copy)]
pub struct PullProgress {
    pub layers_seen: usize,
    pub layers_done: usize,
}

impl PullProgress {
    /// Rough completion fraction in `[0, 1]`. Layer counts are the
    /// only signal the CLI exposes without the daemon API.
    pub fn fraction(&self) -> f64 {
        if self.layers_seen == 0 {
            0.0
        } else {
            self.layers_done as f64 / self.layers_seen as f64
        }
    }
}

/// Operations the lifecycle manager needs from a runtime. A trait so
/// tests can substitute a scripted runtime.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    async fn run(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn start(&self, name: &str) -> ContainerResult<()>;
    async fn stop(&self, name: &str, grace_secs: u32) -> ContainerResult<()>;
    async fn remove(&self, name: &str) -> ContainerResult<()>;
    async fn state(&self, name: &str) -> ContainerResult<ContainerState>;
    /// Host port mapped to `container_port`, if the container is
    /// running and the mapping exists.
    async fn host_port(&self, name: &str, container_port: u16) -> ContainerResult<Option<u16>>;
    async fn stats(&self, name: &str) -> ContainerResult<ContainerStats>;
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;
    async fn pull_image(
        &self,
        image: &str,
        progress: Option<Box<dyn Fn(PullProgress) + Send + Sync>>,
    ) -> ContainerResult<()>;
    async fn build_image(&self, image: &str, context_dir: &str) -> ContainerResult<()>;
    async fn daemon_reachable(&self) -> ContainerResult<()>;
    /// Best-effort attempt to start a stopped daemon. Failure is not
    /// an error; callers re-check reachability afterwards.
    async fn try_start_daemon(&self) {}
}

/// CLI-backed container runtime.
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
}

impl ContainerRuntime {
    pub fn new(runtime_type: RuntimeType) -> Self {
        Self { runtime_type }
    }

    /// Detect an installed runtime. Docker is preferred on macOS,
    /// podman on Linux; either works when only one is present.
    pub fn autodetect() -> ContainerResult<Self> {
        let (first, second) = if cfg!(target_os = "macos") {
            (RuntimeType::Docker, RuntimeType::Podman)
        } else {
            (RuntimeType::Podman, RuntimeType::Docker)
        };
        for candidate in [first, second] {
            if binary_on_path(candidate.binary()) {
                info!("using container runtime: {candidate}");
                return Ok(Self::new(candidate));
            }
        }
        Err(ContainerError::NoRuntimeAvailable)
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    async fn exec(&self, args: &[&str]) -> ContainerResult<String> {
        let binary = self.runtime_type.binary();
        debug!("{binary} {}", args.join(" "));
        let output = Command::new(binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(ContainerError::CommandFailed {
                command: format!("{binary} {}", args.first().copied().unwrap_or("")),
                message,
            })
        }
    }
}

fn binary_on_path(binary: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| {
                let candidate = dir.join(binary);
                candidate.is_file()
            })
        })
        .unwrap_or(false)
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Status", default)]
    status: String,
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn run(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let mut args: Vec<String> = vec!["run".into(), "-d".into()];
        if let Some(ref name) = config.name {
            args.push("--name".into());
            args.push(name.clone());
        }
        for mapping in &config.ports {
            args.push("-p".into());
            args.push(format!("{}:{}", mapping.host_port, mapping.container_port));
        }
        for (key, value) in &config.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for (host, container) in &config.volumes {
            args.push("-v".into());
            // SELinux relabeling for podman volume mounts.
            let suffix = if self.runtime_type == RuntimeType::Podman {
                ":Z"
            } else {
                ""
            };
            args.push(format!("{host}:{container}{suffix}"));
        }
        if let Some(ref workdir) = config.workdir {
            args.push("-w".into());
            args.push(workdir.clone());
        }
        for (key, value) in &config.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        if self.runtime_type == RuntimeType::Podman {
            // Clamp the MTU; pasta inherits the host MTU otherwise,
            // which breaks some VPN setups.
            args.push("--network".into());
            args.push("pasta:-m,1500".into());
        }
        args.push(config.image.clone());
        args.extend(config.command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.exec(&arg_refs).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(ContainerError::ParseError(
                "runtime did not report a container id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn start(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;
        self.exec(&["start", name]).await?;
        Ok(())
    }

    async fn stop(&self, name: &str, grace_secs: u32) -> ContainerResult<()> {
        validate_container_name(name)?;
        let grace = grace_secs.to_string();
        self.exec(&["stop", "-t", &grace, name]).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;
        self.exec(&["rm", "-f", name]).await?;
        Ok(())
    }

    async fn state(&self, name: &str) -> ContainerResult<ContainerState> {
        validate_container_name(name)?;
        let stdout = match self
            .exec(&["inspect", "--format", "{{json .State}}", name])
            .await
        {
            Ok(out) => out,
            Err(ContainerError::CommandFailed { message, .. })
                if message.contains("no such")
                    || message.contains("No such")
                    || message.contains("not found") =>
            {
                return Err(ContainerError::ContainerNotFound(name.to_string()));
            }
            Err(err) => return Err(err),
        };
        let state: InspectState = serde_json::from_str(stdout.trim())
            .map_err(|e| ContainerError::ParseError(format!("inspect state: {e}")))?;
        Ok(ContainerState::parse(&state.status))
    }

    async fn host_port(&self, name: &str, container_port: u16) -> ContainerResult<Option<u16>> {
        validate_container_name(name)?;
        let spec = format!("{container_port}/tcp");
        let stdout = self.exec(&["port", name, &spec]).await?;
        // Output looks like "0.0.0.0:32768" (possibly multiple lines
        // for dual-stack binds); any line's port will do.
        for line in stdout.lines() {
            if let Some((_, port)) = line.trim().rsplit_once(':')
                && let Ok(port) = port.parse::<u16>()
            {
                return Ok(Some(port));
            }
        }
        Ok(None)
    }

    async fn stats(&self, name: &str) -> ContainerResult<ContainerStats> {
        validate_container_name(name)?;
        let stdout = self
            .exec(&["stats", "--no-stream", "--format", "{{json .}}", name])
            .await?;
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| ContainerError::ParseError("empty stats output".to_string()))?;
        serde_json::from_str(line)
            .map_err(|e| ContainerError::ParseError(format!("stats: {e}")))
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;
        match self.exec(&["image", "inspect", image]).await {
            Ok(_) => Ok(true),
            Err(ContainerError::CommandFailed { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn pull_image(
        &self,
        image: &str,
        progress: Option<Box<dyn Fn(PullProgress) + Send + Sync>>,
    ) -> ContainerResult<()> {
        validate_image_name(image)?;
        let binary = self.runtime_type.binary();
        info!("pulling image {image} via {binary}");

        let mut child = Command::new(binary)
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Count layers as a progress approximation. Each layer first
        // appears with "Pulling fs layer" (or similar) and later
        // reports "Pull complete" / "Download complete".
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let mut seen = 0usize;
            let mut done = 0usize;
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains("Pulling fs layer") || line.contains("Copying blob") {
                    seen += 1;
                } else if line.contains("Pull complete") || line.contains("done") {
                    done = (done + 1).min(seen.max(1));
                } else {
                    continue;
                }
                if let Some(ref callback) = progress {
                    callback(PullProgress {
                        layers_seen: seen,
                        layers_done: done,
                    });
                }
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(ContainerError::ImageNotFound(image.to_string()))
        }
    }

    async fn build_image(&self, image: &str, context_dir: &str) -> ContainerResult<()> {
        validate_image_name(image)?;
        if !std::path::Path::new(context_dir).is_dir() {
            return Err(ContainerError::InvalidInput(format!(
                "build context '{context_dir}' is not a directory"
            )));
        }
        info!("building image {image} from {context_dir}");
        let output = self.exec(&["build", "-t", image, context_dir]).await;
        if let Err(ref err) = output {
            warn!("image build failed: {err}");
        }
        output.map(|_| ())
    }

    async fn daemon_reachable(&self) -> ContainerResult<()> {
        match self.exec(&["info", "--format", "{{.ID}}"]).await {
            Ok(_) => Ok(()),
            Err(ContainerError::CommandFailed { message, .. }) => {
                Err(ContainerError::DaemonUnreachable(message))
            }
            Err(err) => Err(err),
        }
    }

    async fn try_start_daemon(&self) {
        match self.runtime_type {
            RuntimeType::Docker => {
                if cfg!(target_os = "macos") {
                    let _ = Command::new("open").args(["-a", "Docker"]).output().await;
                } else {
                    let _ = Command::new("systemctl")
                        .args(["start", "docker"])
                        .output()
                        .await;
                }
            }
            // Podman is daemonless in the configurations we target.
            RuntimeType::Podman => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_type_round_trips() {
        assert_eq!("docker".parse::<RuntimeType>().unwrap(), RuntimeType::Docker);
        assert_eq!("Podman".parse::<RuntimeType>().unwrap(), RuntimeType::Podman);
        assert!("lxc".parse::<RuntimeType>().is_err());
        assert_eq!(RuntimeType::Docker.alternate(), RuntimeType::Podman);
    }

    #[test]
    fn parses_container_state() {
        assert!(ContainerState::parse("running").is_running());
        assert_eq!(ContainerState::parse("exited"), ContainerState::Exited);
        assert_eq!(ContainerState::parse("stopped"), ContainerState::Exited);
        assert_eq!(ContainerState::parse("created"), ContainerState::Created);
        assert_eq!(ContainerState::parse("weird"), ContainerState::Unknown);
    }

    #[test]
    fn pull_progress_fraction() {
        let p = PullProgress {
            layers_seen: 0,
            layers_done: 0,
        };
        assert_eq!(p.fraction(), 0.0);
        let p = PullProgress {
            layers_seen: 4,
            layers_done: 1,
        };
        assert_eq!(p.fraction(), 0.25);
    }
}
