//! Host-side control plane for containerized agents.
//!
//! Everything that runs outside the containers lives here:
//!
//! - [`container`]: runtime wrapper, per-agent lifecycle manager,
//!   image readiness, and health checks.
//! - [`supervisor`]: auxiliary long-running workloads with restart
//!   budgets.
//! - [`client`]: typed HTTP client for the in-container runner API.
//! - [`hub`]: single subscription point for all host event streams.
//! - [`settings`]: file + environment configuration.

pub mod client;
pub mod container;
pub mod hub;
pub mod observability;
pub mod settings;
pub mod supervisor;

pub use client::{AgentApiClient, SessionSummary};
pub use container::health::{HealthChecker, HealthMonitor, MemoryChecker, MemoryThresholds};
pub use container::readiness::{ReadinessCheck, ReadinessConfig};
pub use container::{
    ContainerConfig, ContainerError, ContainerManager, ContainerResult, ContainerRuntime,
    ContainerRuntimeApi, ManagerConfig, RuntimeType,
};
pub use hub::EventHub;
pub use settings::Settings;
pub use supervisor::{ServiceSpec, ServiceState, ServiceSupervisor, SupervisorConfig, SupervisorError};
