//! Browser sessions and their registry.
//!
//! A [`Session`] owns one engine plus all per-session state: lifecycle
//! machine, the current snapshot generation with its ref table, the loop
//! detector and activity bookkeeping. Sessions live behind a
//! `tokio::sync::Mutex` held for the full duration of each action, which is
//! what gives the control plane its single-flight guarantee.

pub mod fsm;
pub mod registry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::engine::Engine;
use crate::loopdetect::LoopDetector;
use crate::snapshot::{RefTable, Snapshot};
pub use fsm::{SessionFsm, SessionState};
pub use registry::SessionRegistry;

/// Shared handle to one session; the mutex is the action lock.
pub type SessionHandle = Arc<Mutex<Session>>;

/// All state owned by one browser session.
pub struct Session {
    pub id: String,
    pub tier: u8,
    pub engine: Box<dyn Engine>,
    pub fsm: SessionFsm,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub action_count: u64,
    /// Bumped every time a fresh snapshot is taken.
    pub generation: u64,
    pub refs: Option<RefTable>,
    pub snapshot: Option<Snapshot>,
    pub loops: LoopDetector,
    /// Distinct domains in visit order, consecutive repeats collapsed.
    pub domains_visited: Vec<String>,
}

impl Session {
    pub fn new(id: String, tier: u8, engine: Box<dyn Engine>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tier,
            engine,
            fsm: SessionFsm::new(),
            created_at: now,
            last_activity: now,
            action_count: 0,
            generation: 0,
            refs: None,
            snapshot: None,
            loops: LoopDetector::new(),
            domains_visited: Vec::new(),
        }
    }

    /// Append a domain to the visit history unless it matches the last one.
    pub fn record_domain_visit(&mut self, domain: &str) {
        if domain.is_empty() {
            return;
        }
        if self.domains_visited.last().map(String::as_str) != Some(domain) {
            self.domains_visited.push(domain.to_string());
        }
    }

    /// Record activity; resets the idle clock.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Reserve the next snapshot generation number.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Replace the current snapshot and ref table atomically.
    pub fn install_snapshot(&mut self, snapshot: Snapshot, refs: RefTable) {
        self.snapshot = Some(snapshot);
        self.refs = Some(refs);
    }

    /// Invalidate refs after the document changed under us.
    pub fn invalidate_refs(&mut self) {
        if let Some(refs) = self.refs.as_mut() {
            refs.mark_stale();
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id.clone(),
            state: self.fsm.state().as_str().to_string(),
            blocked: self.fsm.blocked().map(str::to_string),
            tier: self.tier,
            action_count: self.action_count,
            generation: self.generation,
            idle_seconds: self.idle_for().as_secs(),
            domains_visited: self.domains_visited.len(),
            url: self.snapshot.as_ref().map(|s| s.url.clone()),
        }
    }
}

/// Point-in-time view of one session for status listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: String,
    pub state: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<String>,

    pub tier: u8,
    pub action_count: u64,
    pub generation: u64,
    pub idle_seconds: u64,
    pub domains_visited: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
