//! In-container agent session engine.
//!
//! This crate runs inside each workload container and owns everything
//! between the hosting platform and the agent CLI process:
//!
//! - [`process`]: subprocess lifecycle and the raw event stream.
//! - [`session`]: the session engine (create, resume, send, interrupt).
//! - [`stream`]: reconciliation of raw events into application events.
//! - [`input`]: the human-input bridge for blocking tool calls.
//! - [`store`]: session persistence (event log, metadata, env).

pub mod input;
pub mod process;
pub mod session;
pub mod store;
pub mod stream;

pub use input::{InputBroker, InputError};
pub use process::{AgentProcess, ProcessConfig, ProcessError, ProcessProbe};
pub use session::{NewSessionConfig, SessionEngineConfig, SessionManager};
pub use store::{FsSessionStore, SessionMeta, SessionStore, StoreError};
pub use stream::{ClosedDisposition, ControlSignal, StreamRouter};
