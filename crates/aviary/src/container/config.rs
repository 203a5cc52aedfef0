//! Container configuration and inspection types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::error::{ContainerError, ContainerResult};

/// One host-to-container port mapping. A host port of 0 asks the
/// runtime for an ephemeral port; the real one is learned afterwards
/// via inspect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

impl PortMapping {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }

    pub fn ephemeral(container_port: u16) -> Self {
        Self::new(0, container_port)
    }
}

/// Configuration for creating a workload container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name.
    pub name: Option<String>,
    /// OCI image reference.
    pub image: String,
    /// Command override.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Port mappings.
    pub ports: Vec<PortMapping>,
    /// Volume mounts (host path, container path).
    pub volumes: Vec<(String, String)>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Container labels.
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, envs: HashMap<String, String>) -> Self {
        self.env.extend(envs);
        self
    }

    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.ports.push(mapping);
        self
    }

    pub fn volume(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push((host_path.into(), container_path.into()));
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Validate every field before it reaches the runtime CLI.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;
        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }
        for key in self.env.keys() {
            validate_env_key(key)?;
        }
        for (host, container) in &self.volumes {
            validate_volume_path(host, "host")?;
            validate_volume_path(container, "container")?;
        }
        if let Some(ref workdir) = self.workdir
            && !workdir.starts_with('/')
        {
            return Err(ContainerError::InvalidInput(format!(
                "workdir '{workdir}' must be an absolute path"
            )));
        }
        Ok(())
    }
}

/// Resource snapshot from `stats --no-stream`. Docker and podman
/// disagree on field names, hence the aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerStats {
    #[serde(alias = "ContainerID", alias = "Container")]
    pub container_id: String,

    #[serde(default, alias = "Name")]
    pub name: String,

    #[serde(default, alias = "CPUPerc", alias = "CPU")]
    pub cpu_percent: String,

    #[serde(default, alias = "MemUsage", alias = "MemUsageBytes")]
    pub mem_usage: String,

    #[serde(default, alias = "MemPerc", alias = "Mem")]
    pub mem_percent: String,

    #[serde(default, alias = "PIDs")]
    pub pids: String,
}

impl ContainerStats {
    /// Memory usage as a fraction of the limit, parsed from the
    /// CLI's percentage string (e.g. `"87.5%"`).
    pub fn memory_percent(&self) -> Option<f64> {
        self.mem_percent.trim().trim_end_matches('%').parse().ok()
    }
}

// ============================================================================
// Input validation
// ============================================================================

/// Image references: `[registry/][namespace/]name[:tag][@digest]`.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds 256 characters".to_string(),
        ));
    }
    let valid = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };
    if !image.chars().all(valid) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{image}' contains invalid characters"
        )));
    }
    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }
    Ok(())
}

/// Container names and ids: alphanumeric plus `-` and `_`.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }
    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds 128 characters".to_string(),
        ));
    }
    let first = name.chars().next().unwrap_or('-');
    if !first.is_ascii_alphanumeric() && first != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{name}' must start with an alphanumeric character or underscore"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// POSIX-style environment keys.
fn validate_env_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "environment key cannot be empty".to_string(),
        ));
    }
    let first = key.chars().next().unwrap_or('0');
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment key '{key}' must start with a letter or underscore"
        )));
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment key '{key}' contains invalid characters"
        )));
    }
    Ok(())
}

fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{side} volume path cannot be empty"
        )));
    }
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(format!(
            "{side} volume path '{path}' must be absolute"
        )));
    }
    if path.contains("..") {
        return Err(ContainerError::InvalidInput(format!(
            "{side} volume path '{path}' cannot contain '..'"
        )));
    }
    // Colons would split the -v argument.
    if path.contains(':') {
        return Err(ContainerError::InvalidInput(format!(
            "{side} volume path '{path}' cannot contain ':'"
        )));
    }
    Ok(())
}
