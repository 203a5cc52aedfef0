//! Canonical protocol types shared by the aviary host plane and the
//! in-container runner.
//!
//! Three layers live here:
//!
//! - [`stream`]: the raw newline-delimited JSON events spoken by the
//!   agent CLI over its standard streams.
//! - [`input`]: the blocking tool vocabulary for human-in-the-loop
//!   requests embedded in that stream.
//! - [`events`]: the application-level events republished to
//!   subscribers (UI, host control plane) after reconciliation.

pub mod events;
pub mod input;
pub mod stream;

pub use events::{
    AgentStatusEvent, ContainerStatus, ContextUsage, EnvUpdate, HealthCheckResult, HealthEvent,
    HealthStatus, ReadinessEvent, ReadinessState, SessionEvent,
};
pub use input::{InputRequestArgs, InputRequestKind, PendingInputNotice};
pub use stream::{
    AgentEvent, AgentInput, BlockDelta, ContentBlock, StreamDelta, TurnResult, Usage,
    SUBTYPE_COMPACT_BOUNDARY, SUBTYPE_INIT,
};
