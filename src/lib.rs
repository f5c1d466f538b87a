//! Browser session and action control plane for AI agents.
//!
//! Agents act on pages through short-lived ref tokens (`e1`, `e2`, ...)
//! handed out by snapshots of the accessibility tree. Each snapshot is a
//! generation: taking a new one invalidates every token of the previous
//! generation, so an agent can never act on an element the page no longer
//! shows. Around that core sit per-domain rate limiting, repeated-action
//! loop detection, a per-session lifecycle machine with single-flight
//! execution, and an idle-session reaper.
//!
//! Entry points are [`ControlPlane::dispatch`] and [`ControlPlane::snapshot`];
//! transport and authentication live elsewhere.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod loopdetect;
pub mod plane;
pub mod session;
pub mod snapshot;

pub use config::Config;
pub use dispatch::{ActionDispatcher, ActionKind, ActionParams, ActionRequest, ActionResult};
pub use engine::{
    cdp::{CdpEngine, CdpEngineFactory},
    ElementHandle, Engine, EngineFactory, EngineOutcome, Primitive, RawNode,
};
pub use error::{BrowserError, BrowserResult, ErrorInfo, Recoverability};
pub use limiter::{Admission, RateLimiter};
pub use loopdetect::{LoopDetector, LoopSeverity};
pub use plane::{ControlPlane, LaunchResult, SnapshotResult};
pub use session::{Session, SessionRegistry, SessionState, SessionStatus};
pub use snapshot::{
    parse_ref, DiffCounts, DiffStatus, Node, RefTable, RefToken, Snapshot, SnapshotEngine,
    SnapshotOptions,
};
