//! Transfer engine for the remotedrop client.
//!
//! [`FileTransferEngine`] is the public surface: it owns the transport,
//! the session table, the worker pool, the policy gate, and the settings
//! store, dispatches inbound frames to per-transfer workers, and emits
//! observable [`EngineEvent`]s.

mod approval;
mod config;
mod controller;
mod events;
mod policy;
mod settings;
mod validate;
mod worker;

pub use approval::{is_high_risk, ApprovalDecision, ApprovalFuture, ApprovalUi, HIGH_RISK_EXTENSIONS};
pub use config::EngineConfig;
pub use controller::{EngineError, FileTransferEngine};
pub use events::EngineEvent;
pub use policy::{evaluate, PolicyDecision, PolicySnapshot};
pub use settings::SettingsStore;
