//! Session registry with idle reclamation.
//!
//! Sessions are kept in a [`DashMap`] behind per-session mutexes. The
//! background sweeper only ever `try_lock`s: a session whose lock is held is
//! mid-action and therefore not idle, so it is skipped rather than waited
//! on. The same rule applies to status listings, which report lock-held
//! sessions as acting without touching their state.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{BrowserError, BrowserResult};
use crate::session::{Session, SessionHandle, SessionState, SessionStatus};

struct Registered {
    tier: u8,
    handle: SessionHandle,
}

/// Owns every live session and the idle sweeper.
pub struct SessionRegistry {
    sessions: DashMap<String, Registered>,
    config: SessionConfig,
    sweep_token: CancellationToken,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    /// Create the registry and start its sweeper task.
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let registry = Arc::new(Self {
            sessions: DashMap::new(),
            config,
            sweep_token: CancellationToken::new(),
            sweep_task: Mutex::new(None),
        });
        let handle = Self::spawn_sweeper(registry.clone(), registry.sweep_token.clone());
        // Registry was just created; nothing else can hold this lock yet.
        if let Ok(mut slot) = registry.sweep_task.try_lock() {
            *slot = Some(handle);
        }
        registry
    }

    /// Register a freshly launched session, enforcing the session cap.
    /// A rejected session is handed back whole so the caller can tear
    /// down its engine instead of leaking the browser process.
    pub fn insert(&self, session: Session) -> Result<SessionHandle, Session> {
        if self.sessions.len() >= self.config.max_sessions {
            return Err(session);
        }
        let id = session.id.clone();
        let tier = session.tier;
        let handle: SessionHandle = Arc::new(Mutex::new(session));
        self.sessions.insert(
            id.clone(),
            Registered {
                tier,
                handle: handle.clone(),
            },
        );
        info!(session = %id, tier, total = self.sessions.len(), "session registered");
        Ok(handle)
    }

    pub fn get(&self, session_id: &str) -> BrowserResult<SessionHandle> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().handle.clone())
            .ok_or_else(|| BrowserError::SessionNotFound(session_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Status of every session. Lock-held sessions are reported as acting.
    pub fn list_status(&self) -> Vec<SessionStatus> {
        let mut out = Vec::new();
        for entry in self.sessions.iter() {
            match entry.value().handle.try_lock() {
                Ok(session) => out.push(session.status()),
                Err(_) => out.push(SessionStatus {
                    id: entry.key().clone(),
                    state: SessionState::Acting.as_str().to_string(),
                    blocked: None,
                    tier: entry.value().tier,
                    action_count: 0,
                    generation: 0,
                    idle_seconds: 0,
                    domains_visited: 0,
                    url: None,
                }),
            }
        }
        out
    }

    /// Close one session and drop it from the registry. Waits for any
    /// in-flight action to finish first.
    pub async fn close(&self, session_id: &str) -> BrowserResult<()> {
        let handle = self.get(session_id)?;
        {
            let mut session = handle.lock().await;
            close_locked(&mut session).await;
        }
        self.sessions.remove(session_id);
        info!(session = %session_id, "session closed");
        Ok(())
    }

    /// Stop the sweeper and close every remaining session.
    pub async fn shutdown(&self) {
        self.sweep_token.cancel();
        let task = self.sweep_task.lock().await.take();
        if let Some(handle) = task {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("sweeper did not stop within timeout");
            }
        }

        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(err) = self.close(&id).await {
                warn!(session = %id, %err, "close during shutdown failed");
            }
        }
    }

    fn spawn_sweeper(registry: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let interval = registry.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.sweep_idle().await,
                    _ = token.cancelled() => {
                        debug!("sweeper cancelled");
                        break;
                    }
                }
            }
        })
    }

    /// Reclaim sessions idle past the TTL. Never blocks on a busy session.
    pub async fn sweep_idle(&self) {
        let ttl = self.config.idle_ttl();
        let mut expired = Vec::new();

        for entry in self.sessions.iter() {
            if let Ok(session) = entry.value().handle.try_lock() {
                if reapable(&session, ttl) {
                    expired.push(entry.key().clone());
                }
            }
        }

        for id in expired {
            // Re-check under the lock; the session may have been used
            // between the scan and now.
            let Some(entry) = self.sessions.get(&id) else {
                continue;
            };
            let handle = entry.value().handle.clone();
            drop(entry);
            let Ok(mut session) = handle.try_lock() else {
                continue;
            };
            if !reapable(&session, ttl) {
                continue;
            }
            info!(session = %id, idle_secs = session.idle_for().as_secs(), "reclaiming idle session");
            close_locked(&mut session).await;
            drop(session);
            self.sessions.remove(&id);
        }
    }
}

/// Only settled sessions are eligible for reclamation. A session caught
/// mid-transition (launching, closing) belongs to whoever is driving it.
fn reapable(session: &Session, ttl: Duration) -> bool {
    match session.fsm.state() {
        SessionState::Closed => true,
        SessionState::Ready | SessionState::Crashed => session.idle_for() > ttl,
        _ => false,
    }
}

/// Drive a locked session to `Closed`, tolerating already-closed states.
async fn close_locked(session: &mut Session) {
    use SessionState::*;
    match session.fsm.state() {
        Closed => return,
        Closing => {}
        _ => {
            if let Err(err) = session.fsm.transition(Closing) {
                warn!(session = %session.id, %err, "forcing close from invalid state");
            }
        }
    }
    if let Err(err) = session.engine.close().await {
        warn!(session = %session.id, %err, "engine close failed");
    }
    if session.fsm.state() != Closed {
        let _ = session.fsm.transition(Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineOutcome, Primitive, RawNode};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    struct ProbeEngine {
        closed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Engine for ProbeEngine {
        async fn extract_tree(&self, _max_depth: usize) -> BrowserResult<Vec<RawNode>> {
            Ok(Vec::new())
        }

        async fn execute(&self, _primitive: Primitive) -> BrowserResult<EngineOutcome> {
            Ok(EngineOutcome::default())
        }

        async fn is_alive(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        async fn current_url(&self) -> BrowserResult<String> {
            Ok("about:blank".to_string())
        }

        async fn title(&self) -> BrowserResult<String> {
            Ok(String::new())
        }

        async fn tab_count(&self) -> usize {
            1
        }

        async fn close(&self) -> BrowserResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn probe_session(id: &str) -> (Session, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let engine = ProbeEngine {
            closed: closed.clone(),
        };
        let mut session = Session::new(id.to_string(), 1, Box::new(engine));
        session.fsm.transition(SessionState::Launching).unwrap();
        session.fsm.transition(SessionState::Ready).unwrap();
        (session, closed)
    }

    fn insert_ok(registry: &SessionRegistry, session: Session) -> SessionHandle {
        match registry.insert(session) {
            Ok(handle) => handle,
            Err(rejected) => panic!("registry rejected session {}", rejected.id),
        }
    }

    fn small_config() -> SessionConfig {
        SessionConfig {
            max_sessions: 2,
            idle_ttl_secs: 0,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn insert_enforces_the_session_cap() {
        let registry = SessionRegistry::new(small_config());
        insert_ok(&registry, probe_session("a").0);
        insert_ok(&registry, probe_session("b").0);
        let rejected = match registry.insert(probe_session("c").0) {
            Ok(_) => panic!("cap not enforced"),
            Err(session) => session,
        };
        assert_eq!(rejected.id, "c");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn get_unknown_session_is_an_error() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let err = registry.get("missing").err().expect("must be an error");
        assert!(matches!(err, BrowserError::SessionNotFound(_)));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn close_tears_down_the_engine_and_removes_the_entry() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (session, closed) = probe_session("a");
        insert_ok(&registry, session);

        registry.close("a").await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(registry.get("a").is_err());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_reclaims_idle_but_skips_locked_sessions() {
        let registry = SessionRegistry::new(small_config());
        let (mut idle, idle_closed) = probe_session("idle");
        idle.last_activity = Instant::now() - Duration::from_secs(10);
        insert_ok(&registry, idle);

        let (mut busy, busy_closed) = probe_session("busy");
        busy.last_activity = Instant::now() - Duration::from_secs(10);
        let busy_handle = insert_ok(&registry, busy);

        // Simulate an in-flight action on the busy session.
        let guard = busy_handle.lock().await;
        registry.sweep_idle().await;
        drop(guard);

        assert!(idle_closed.load(Ordering::SeqCst));
        assert!(registry.get("idle").is_err());
        assert!(!busy_closed.load(Ordering::SeqCst));
        assert!(registry.get("busy").is_ok());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_leaves_mid_launch_sessions_alone() {
        let registry = SessionRegistry::new(small_config());
        let closed = Arc::new(AtomicBool::new(false));
        let engine = ProbeEngine {
            closed: closed.clone(),
        };
        let mut session = Session::new("launching".to_string(), 1, Box::new(engine));
        session.fsm.transition(SessionState::Launching).unwrap();
        session.last_activity = Instant::now() - Duration::from_secs(10);
        insert_ok(&registry, session);

        registry.sweep_idle().await;
        assert!(!closed.load(Ordering::SeqCst));
        assert!(registry.get("launching").is_ok());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn list_status_reports_busy_sessions_as_acting() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let handle = insert_ok(&registry, probe_session("a").0);
        let guard = handle.lock().await;

        let statuses = registry.list_status();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, "acting");
        drop(guard);

        let statuses = registry.list_status();
        assert_eq!(statuses[0].state, "ready");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (_, closed_a) = {
            let (s, c) = probe_session("a");
            insert_ok(&registry, s);
            ((), c)
        };
        let (_, closed_b) = {
            let (s, c) = probe_session("b");
            insert_ok(&registry, s);
            ((), c)
        };

        registry.shutdown().await;
        assert!(closed_a.load(Ordering::SeqCst));
        assert!(closed_b.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }
}
