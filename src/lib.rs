//! Network identity rotation for a fleet of agents.
//!
//! Each registered agent holds one `(address, port)` identity drawn from a
//! shared pool and swaps it for a fresh one on its own schedule. The
//! [`RotationManager`] is the only entry point; everything it returns is a
//! snapshot.

pub mod config;
pub mod endpoints;
pub mod error;
pub mod identity;
pub mod logging;
pub mod manager;
pub mod pool;
pub mod probe;
pub mod record;
pub mod scheduler;
pub mod stats;

pub use config::{AgentSettings, ConfigUpdate, NetworkConfig, RotationConfig, Timings};
pub use endpoints::{EndpointSource, HttpEndpointSource, RefreshResult};
pub use error::{ConfigError, FetchError, RotationError};
pub use identity::{NetworkIdentity, Subnet};
pub use manager::{ManagerOptions, RotateResult, RotationManager};
pub use probe::ProbeResult;
pub use record::{AgentStatus, HistoryEntry, RotateOutcome, RotationReason};
pub use scheduler::ShutdownReport;
pub use stats::{RotationReport, Statistics};
