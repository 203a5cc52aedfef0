//! Host configuration.
//!
//! Values come from an optional TOML file (default
//! `~/.config/aviary/config.toml`) with `AVIARY_*` environment
//! variables layered on top, e.g. `AVIARY_IMAGE` or
//! `AVIARY_MAX_RESTARTS`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::container::manager::ManagerConfig;
use crate::container::health::MemoryThresholds;
use crate::container::readiness::ReadinessConfig;
use crate::supervisor::SupervisorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Image every agent container runs.
    pub image: String,
    /// Preferred runtime: `docker` or `podman`. Autodetected when
    /// unset.
    pub runtime: Option<String>,
    /// Built from this directory when the image is missing, instead
    /// of pulled.
    pub build_context: Option<String>,
    /// Host directory of per-agent workspaces, mounted into
    /// containers.
    pub agents_dir: Option<String>,
    /// State directory for logs and supervisor output.
    pub data_dir: PathBuf,
    /// Port the in-container runner API listens on.
    pub container_port: u16,
    /// Grace period for container stop.
    pub stop_grace_secs: u32,
    /// Container state reconciliation interval.
    pub sync_interval_secs: u64,
    /// Health check interval.
    pub health_interval_secs: u64,
    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    /// Supervised service restart budget.
    pub max_restarts: usize,
    pub restart_window_secs: u64,
    /// Context window assumed for a session until the agent reports a
    /// real one. Forwarded to runners at container start.
    pub default_context_window: u64,
    /// How long a pending human-input request may wait before the
    /// runner auto-rejects it. Forwarded to runners.
    pub input_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            image: "aviary/agent:latest".to_string(),
            runtime: None,
            build_context: None,
            agents_dir: None,
            data_dir: dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("aviary"),
            container_port: 8787,
            stop_grace_secs: 10,
            sync_interval_secs: 300,
            health_interval_secs: 30,
            memory_warning_percent: 85.0,
            memory_critical_percent: 95.0,
            max_restarts: 3,
            restart_window_secs: 300,
            default_context_window: 200_000,
            input_timeout_secs: 300,
        }
    }
}

impl Settings {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("aviary").join("config.toml"))
    }

    /// Load from the given file (or the default location when `None`)
    /// with environment overrides applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        let file = path.map(Path::to_path_buf).or_else(Self::default_path);
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("AVIARY"));
        let settings = builder
            .build()
            .context("reading configuration")?
            .try_deserialize::<Settings>()
            .context("deserializing configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.memory_warning_percent >= self.memory_critical_percent {
            anyhow::bail!(
                "memory_warning_percent ({}) must be below memory_critical_percent ({})",
                self.memory_warning_percent,
                self.memory_critical_percent
            );
        }
        if self.container_port == 0 {
            anyhow::bail!("container_port must be non-zero");
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let mut base_env = std::collections::HashMap::new();
        base_env.insert(
            "AVIARY_DEFAULT_CONTEXT_WINDOW".to_string(),
            self.default_context_window.to_string(),
        );
        base_env.insert(
            "AVIARY_INPUT_TIMEOUT_SECS".to_string(),
            self.input_timeout_secs.to_string(),
        );
        ManagerConfig {
            image: self.image.clone(),
            container_port: self.container_port,
            stop_grace_secs: self.stop_grace_secs,
            agents_dir: self.agents_dir.clone(),
            base_env,
        }
    }

    pub fn readiness_config(&self) -> ReadinessConfig {
        ReadinessConfig {
            image: self.image.clone(),
            build_context: self.build_context.clone(),
        }
    }

    pub fn memory_thresholds(&self) -> MemoryThresholds {
        MemoryThresholds {
            warning_percent: self.memory_warning_percent,
            critical_percent: self.memory_critical_percent,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            log_dir: self.data_dir.join("services"),
            settle: Duration::from_secs(2),
            restart_window: Duration::from_secs(self.restart_window_secs),
            max_restarts: self.max_restarts,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}
