//! Control-plane facade.
//!
//! The two entry points the transport layer calls are [`ControlPlane::dispatch`]
//! and [`ControlPlane::snapshot`]; everything else is session lifecycle.
//! The plane performs no framing or authentication and never retries on its
//! own. Rate-limiter state is the only thing shared across sessions; each
//! session's snapshot, refs and counters live behind that session's lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::dispatch::{ActionDispatcher, ActionRequest, ActionResult};
use crate::engine::{ElementHandle, EngineFactory};
use crate::error::{BrowserError, BrowserResult};
use crate::limiter::RateLimiter;
use crate::session::{Session, SessionRegistry, SessionState, SessionStatus};
use crate::snapshot::{DiffCounts, PageMeta, SnapshotEngine, SnapshotOptions};

/// Outcome of a session launch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LaunchResult {
    pub session_id: String,
    pub tier: u8,
    pub state: String,
}

/// Wire form of one snapshot generation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SnapshotResult {
    pub generation: u64,
    pub url: String,
    pub title: String,
    pub tab_count: usize,
    /// Ref-labeled tree, ready to show to an agent.
    pub tree: String,
    /// Token -> handle map for this generation, e.g. `"e3"` -> button "Save".
    pub refs: BTreeMap<String, ElementHandle>,
    pub diff: DiffCounts,
    pub truncated: bool,
}

/// Owns the registry, limiter and dispatcher; serves many sessions at once.
pub struct ControlPlane {
    config: Config,
    registry: Arc<SessionRegistry>,
    dispatcher: ActionDispatcher,
    snapshots: SnapshotEngine,
    factory: Arc<dyn EngineFactory>,
}

impl ControlPlane {
    /// Build the plane and start the registry sweeper. Must be called from
    /// within a tokio runtime.
    pub fn new(config: Config, factory: Arc<dyn EngineFactory>) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let registry = SessionRegistry::new(config.session.clone());
        let dispatcher = ActionDispatcher::new(limiter, config.action_timeout());
        let snapshots = SnapshotEngine::new(config.snapshot.clone());
        Self {
            config,
            registry,
            dispatcher,
            snapshots,
            factory,
        }
    }

    /// Launch a new session at the given stealth tier.
    pub async fn launch(&self, tier: u8) -> BrowserResult<LaunchResult> {
        if self.registry.len() >= self.config.session.max_sessions {
            return Err(BrowserError::SessionLimit(self.config.session.max_sessions));
        }

        let session_id = Uuid::new_v4().simple().to_string();
        let engine = match tokio::time::timeout(
            self.config.launch_timeout(),
            self.factory.launch(tier),
        )
        .await
        {
            Ok(engine) => engine?,
            Err(_) => {
                return Err(BrowserError::EngineUnavailable(format!(
                    "launch timed out after {}ms",
                    self.config.session.launch_timeout_ms
                )))
            }
        };

        let mut session = Session::new(session_id.clone(), tier, engine);
        if let Err(err) = session
            .fsm
            .transition(SessionState::Launching)
            .and_then(|_| session.fsm.transition(SessionState::Ready))
        {
            let _ = session.engine.close().await;
            return Err(err);
        }

        // Two launches can race past the pre-check above; the loser must
        // tear its engine down or the browser process leaks.
        if let Err(rejected) = self.registry.insert(session) {
            let _ = rejected.engine.close().await;
            return Err(BrowserError::SessionLimit(self.config.session.max_sessions));
        }
        info!(session = %session_id, tier, "session launched");

        Ok(LaunchResult {
            session_id,
            tier,
            state: SessionState::Ready.as_str().to_string(),
        })
    }

    /// Run one action against a session. Waits for any in-flight operation
    /// on the same session; different sessions proceed in parallel.
    pub async fn dispatch(
        &self,
        session_id: &str,
        request: ActionRequest,
    ) -> BrowserResult<ActionResult> {
        let handle = self.registry.get(session_id)?;
        let mut session = handle.lock().await;
        Ok(self.dispatcher.dispatch(&mut session, request).await)
    }

    /// Take a fresh snapshot, producing a new generation and ref table.
    /// The previous generation's refs become unresolvable.
    pub async fn snapshot(
        &self,
        session_id: &str,
        options: SnapshotOptions,
    ) -> BrowserResult<SnapshotResult> {
        let handle = self.registry.get(session_id)?;
        let mut session = handle.lock().await;

        match session.fsm.state() {
            SessionState::Ready => session.fsm.transition(SessionState::Acting)?,
            other => {
                return Err(BrowserError::EngineUnavailable(format!(
                    "session not ready ({})",
                    other.as_str()
                )))
            }
        }

        let result = self.snapshot_locked(&mut session, &options).await;
        // The lock must never outlive an operation in Acting state.
        let _ = session.fsm.transition(SessionState::Ready);
        result
    }

    async fn snapshot_locked(
        &self,
        session: &mut Session,
        options: &SnapshotOptions,
    ) -> BrowserResult<SnapshotResult> {
        let depth = options.max_depth.unwrap_or(self.config.snapshot.max_depth);
        let raw = match tokio::time::timeout(
            self.config.action_timeout(),
            session.engine.extract_tree(depth),
        )
        .await
        {
            Ok(raw) => raw?,
            Err(_) => {
                return Err(BrowserError::ExtractionTimeout(
                    self.config.session.action_timeout_ms,
                ))
            }
        };

        let meta = PageMeta {
            url: session
                .engine
                .current_url()
                .await
                .unwrap_or_else(|_| String::from("about:blank")),
            title: session.engine.title().await.unwrap_or_default(),
            tab_count: session.engine.tab_count().await,
        };

        let generation = session.next_generation();
        let (snapshot, table) =
            self.snapshots
                .build(&raw, meta, generation, session.snapshot.as_ref(), options);

        let refs: BTreeMap<String, ElementHandle> = table
            .entries()
            .map(|(token, handle)| (token.to_string(), handle.clone()))
            .collect();
        let result = SnapshotResult {
            generation,
            url: snapshot.url.clone(),
            title: snapshot.title.clone(),
            tab_count: snapshot.tab_count,
            tree: snapshot.text.clone(),
            diff: snapshot.counts,
            truncated: snapshot.truncated,
            refs,
        };

        session.install_snapshot(snapshot, table);
        session.touch();
        Ok(result)
    }

    /// Close one session and release its engine.
    pub async fn close(&self, session_id: &str) -> BrowserResult<()> {
        self.registry.close(session_id).await
    }

    /// Status of every session; never blocks on busy ones.
    pub fn status(&self) -> Vec<SessionStatus> {
        self.registry.list_status()
    }

    /// Stop the sweeper and close every session.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
