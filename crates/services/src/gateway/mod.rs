//! The realtime voice gateway's core (spec §4): Session Store, Connection
//! Registry, Metrics Collector, Turn Orchestrator and Message Router. These
//! are the three "global mutable states" (spec §9) plus the two components
//! that sit on top of them; the `api` crate wires them to an actual
//! websocket transport.

pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod session;

pub use metrics::{
    Alert, AlertThresholds, DisconnectReason, FailureReason, MetricsCollector, MetricsSnapshot,
};
pub use orchestrator::{ArchivedTurn, TurnArchiver, TurnOrchestrator};
pub use registry::{Connection, ConnectionRegistry, ConnectionSink};
pub use router::MessageRouter;
pub use session::{spawn_expiry_sweep, SessionStore, SessionStoreError, TransitionOutcome};
