//! End-to-end tests over the control plane with a scripted engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use refbrowse::{
    ActionKind, ActionParams, ActionRequest, Config, ControlPlane, Engine, EngineFactory,
    EngineOutcome, LoopSeverity, Primitive, RawNode,
};

/// Scripted in-memory engine. Navigation swaps the current URL and forest;
/// clicks on scripted element names simulate a page replacement.
struct MockState {
    url: Mutex<String>,
    forest: Mutex<Vec<RawNode>>,
    /// Element name -> (url, forest) installed when that element is clicked.
    click_navigations: Mutex<BTreeMap<String, (String, Vec<RawNode>)>>,
    /// Challenge marker reported by the next executed primitive.
    block_next: Mutex<Option<String>>,
    /// One-shot delay applied to the next executed primitive only.
    stall_next: Mutex<Option<Duration>>,
    exec_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closes: AtomicUsize,
}

impl MockState {
    fn new(forest: Vec<RawNode>) -> Arc<Self> {
        Arc::new(Self {
            url: Mutex::new("https://example.com/start".to_string()),
            forest: Mutex::new(forest),
            click_navigations: Mutex::new(BTreeMap::new()),
            block_next: Mutex::new(None),
            stall_next: Mutex::new(None),
            exec_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    fn with_delay(forest: Vec<RawNode>, delay: Duration) -> Arc<Self> {
        let state = Self::new(forest);
        // Arc was just created; no other references exist.
        let mut state = Arc::try_unwrap(state).ok().expect("unshared");
        state.exec_delay = delay;
        Arc::new(state)
    }

    fn stall_next_execute(&self, delay: Duration) {
        *self.stall_next.lock().unwrap() = Some(delay);
    }

    fn script_click_navigation(&self, element: &str, url: &str, forest: Vec<RawNode>) {
        self.click_navigations
            .lock()
            .unwrap()
            .insert(element.to_string(), (url.to_string(), forest));
    }
}

struct MockEngine {
    state: Arc<MockState>,
}

#[async_trait]
impl Engine for MockEngine {
    async fn extract_tree(&self, _max_depth: usize) -> refbrowse::BrowserResult<Vec<RawNode>> {
        Ok(self.state.forest.lock().unwrap().clone())
    }

    async fn execute(&self, primitive: Primitive) -> refbrowse::BrowserResult<EngineOutcome> {
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.state.exec_delay.is_zero() {
            tokio::time::sleep(self.state.exec_delay).await;
        }
        let stall = self.state.stall_next.lock().unwrap().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        let mut outcome = EngineOutcome::default();
        match primitive {
            Primitive::Navigate { url } => {
                *self.state.url.lock().unwrap() = url;
                outcome.navigated = true;
            }
            Primitive::Click { target } => {
                let scripted = target.name.as_ref().and_then(|name| {
                    self.state.click_navigations.lock().unwrap().get(name).cloned()
                });
                if let Some((url, forest)) = scripted {
                    *self.state.url.lock().unwrap() = url;
                    *self.state.forest.lock().unwrap() = forest;
                }
            }
            Primitive::Wait { seconds } => {
                tokio::time::sleep(Duration::from_secs_f64(seconds.min(0.05))).await;
            }
            Primitive::ExtractText { .. } => {
                outcome.content = Some("mock page text".to_string());
            }
            _ => {}
        }

        outcome.blocked = self.state.block_next.lock().unwrap().take();
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn current_url(&self) -> refbrowse::BrowserResult<String> {
        Ok(self.state.url.lock().unwrap().clone())
    }

    async fn title(&self) -> refbrowse::BrowserResult<String> {
        Ok("Mock Page".to_string())
    }

    async fn tab_count(&self) -> usize {
        1
    }

    async fn close(&self) -> refbrowse::BrowserResult<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands each launch the next scripted state, newest first.
struct MockFactory {
    states: Mutex<Vec<Arc<MockState>>>,
    launch_delay: Duration,
}

impl MockFactory {
    fn single(state: Arc<MockState>) -> Arc<Self> {
        Self::many(vec![state])
    }

    fn many(states: Vec<Arc<MockState>>) -> Arc<Self> {
        let mut states = states;
        states.reverse();
        Arc::new(Self {
            states: Mutex::new(states),
            launch_delay: Duration::ZERO,
        })
    }

    /// Like `many`, but every launch parks at an await point first, so
    /// concurrent launches genuinely overlap.
    fn slow(states: Vec<Arc<MockState>>, launch_delay: Duration) -> Arc<Self> {
        let mut states = states;
        states.reverse();
        Arc::new(Self {
            states: Mutex::new(states),
            launch_delay,
        })
    }
}

#[async_trait]
impl EngineFactory for MockFactory {
    async fn launch(&self, _tier: u8) -> refbrowse::BrowserResult<Box<dyn Engine>> {
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        let state = self
            .states
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| refbrowse::BrowserError::EngineUnavailable("no scripted engine".into()))?;
        Ok(Box::new(MockEngine { state }))
    }
}

fn node(role: &str, name: &str) -> RawNode {
    RawNode {
        role: role.to_string(),
        name: Some(name.to_string()),
        ..RawNode::default()
    }
}

fn five_element_page() -> Vec<RawNode> {
    vec![
        node("button", "First"),
        node("link", "Second"),
        node("button", "Third"),
        node("textbox", "Fourth"),
        node("checkbox", "Fifth"),
    ]
}

/// Route log output through the test harness; honors `RUST_LOG`.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn test_config() -> Config {
    init_tracing();
    let mut config = Config::default();
    // Keep background machinery out of timing-sensitive tests.
    config.session.sweep_interval_secs = 3600;
    config.rate_limits.default = 1000;
    config.rate_limits.per_domain.clear();
    config
}

fn click(ref_token: &str) -> ActionRequest {
    ActionRequest {
        kind: ActionKind::Click,
        ref_token: Some(ref_token.to_string()),
        params: ActionParams::default(),
    }
}

fn navigate(url: &str) -> ActionRequest {
    ActionRequest {
        kind: ActionKind::Navigate,
        ref_token: None,
        params: ActionParams {
            url: Some(url.to_string()),
            ..ActionParams::default()
        },
    }
}

#[tokio::test]
async fn refs_are_assigned_in_document_order() {
    let state = MockState::new(five_element_page());
    let plane = ControlPlane::new(test_config(), MockFactory::single(state));
    let launch = plane.launch(1).await.unwrap();

    let snapshot = plane
        .snapshot(&launch.session_id, Default::default())
        .await
        .unwrap();

    assert_eq!(snapshot.generation, 1);
    let tokens: Vec<&String> = snapshot.refs.keys().collect();
    assert_eq!(tokens, ["e1", "e2", "e3", "e4", "e5"]);
    assert_eq!(snapshot.refs["e1"].name.as_deref(), Some("First"));
    assert_eq!(snapshot.refs["e3"].name.as_deref(), Some("Third"));
    assert_eq!(snapshot.refs["e5"].name.as_deref(), Some("Fifth"));
    assert!(snapshot.tree.contains("button \"First\" [e1]"));

    plane.shutdown().await;
}

#[tokio::test]
async fn navigation_invalidates_refs_until_the_next_snapshot() {
    let state = MockState::new(five_element_page());
    state.script_click_navigation(
        "Third",
        "https://example.com/next",
        vec![node("button", "Fresh")],
    );
    let plane = ControlPlane::new(test_config(), MockFactory::single(state));
    let session = plane.launch(1).await.unwrap().session_id;

    plane.snapshot(&session, Default::default()).await.unwrap();

    // Click e3 triggers navigation: page_changed and refs go stale.
    let result = plane.dispatch(&session, click("e3")).await.unwrap();
    assert!(result.success);
    assert!(result.page_changed);
    assert_eq!(result.new_title.as_deref(), Some("Mock Page"));

    // The same token now fails instead of resolving against the old page.
    let result = plane.dispatch(&session, click("e3")).await.unwrap();
    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.code, "REF_NOT_FOUND");
    assert_eq!(
        error.recoverability,
        refbrowse::Recoverability::Recoverable
    );

    // A fresh snapshot restores actionability with a new generation.
    let snapshot = plane.snapshot(&session, Default::default()).await.unwrap();
    assert_eq!(snapshot.generation, 2);
    assert_eq!(snapshot.refs["e1"].name.as_deref(), Some("Fresh"));
    let result = plane.dispatch(&session, click("e1")).await.unwrap();
    assert!(result.success);

    plane.shutdown().await;
}

#[tokio::test]
async fn snapshot_diff_reports_new_and_removed_nodes() {
    let state = MockState::new(five_element_page());
    let plane = ControlPlane::new(test_config(), MockFactory::single(state.clone()));
    let session = plane.launch(1).await.unwrap().session_id;

    let first = plane.snapshot(&session, Default::default()).await.unwrap();
    assert_eq!(first.diff.new, 0);
    assert_eq!(first.diff.removed, 0);

    *state.forest.lock().unwrap() = vec![
        node("button", "First"),
        node("link", "Second"),
        node("button", "Brand New"),
    ];
    let second = plane.snapshot(&session, Default::default()).await.unwrap();
    assert_eq!(second.generation, 2);
    assert_eq!(second.diff.new, 1);
    assert_eq!(second.diff.removed, 3);
    assert!(second.tree.contains("(new)"));
    assert!(second.tree.contains("Removed since previous snapshot:"));

    plane.shutdown().await;
}

#[tokio::test]
async fn rate_limited_actions_are_denied_with_a_wait_hint() {
    let state = MockState::new(five_element_page());
    let mut config = test_config();
    config.rate_limits.default = 2;
    let plane = ControlPlane::new(config, MockFactory::single(state));
    let session = plane.launch(1).await.unwrap().session_id;

    let first = plane
        .dispatch(&session, navigate("https://example.com/a"))
        .await
        .unwrap();
    assert!(first.success);
    let second = plane
        .dispatch(&session, navigate("https://example.com/b"))
        .await
        .unwrap();
    assert!(second.success);

    let third = plane
        .dispatch(&session, navigate("https://example.com/c"))
        .await
        .unwrap();
    assert!(!third.success);
    let error = third.error.unwrap();
    assert_eq!(error.code, "RATE_LIMITED");
    let wait = third.wait_seconds.unwrap();
    assert!(wait > 0.0 && wait <= 60.0, "wait was {wait}");

    // Read-only actions bypass admission entirely.
    let extract = plane
        .dispatch(
            &session,
            ActionRequest {
                kind: ActionKind::Extract,
                ref_token: None,
                params: ActionParams::default(),
            },
        )
        .await
        .unwrap();
    assert!(extract.success);
    assert_eq!(extract.content.as_deref(), Some("mock page text"));

    plane.shutdown().await;
}

#[tokio::test]
async fn repeated_identical_actions_escalate_loop_severity() {
    let state = MockState::new(five_element_page());
    let plane = ControlPlane::new(test_config(), MockFactory::single(state));
    let session = plane.launch(1).await.unwrap().session_id;
    plane.snapshot(&session, Default::default()).await.unwrap();

    let mut severities = Vec::new();
    for _ in 0..9 {
        let result = plane.dispatch(&session, click("e1")).await.unwrap();
        assert!(result.success);
        severities.push(result.loop_severity);
    }

    use LoopSeverity::*;
    assert_eq!(
        severities,
        vec![None, None, Warning, Warning, Stuck, Stuck, Critical, Critical, Critical]
    );

    plane.shutdown().await;
}

#[tokio::test]
async fn a_different_action_resets_the_loop_counter() {
    let state = MockState::new(five_element_page());
    let plane = ControlPlane::new(test_config(), MockFactory::single(state));
    let session = plane.launch(1).await.unwrap().session_id;
    plane.snapshot(&session, Default::default()).await.unwrap();

    for _ in 0..4 {
        plane.dispatch(&session, click("e1")).await.unwrap();
    }
    let breaker = plane.dispatch(&session, click("e2")).await.unwrap();
    assert_eq!(breaker.loop_severity, LoopSeverity::None);
    let resumed = plane.dispatch(&session, click("e1")).await.unwrap();
    assert_eq!(resumed.loop_severity, LoopSeverity::None);

    plane.shutdown().await;
}

#[tokio::test]
async fn same_session_dispatches_never_interleave() {
    let state = MockState::with_delay(five_element_page(), Duration::from_millis(50));
    let plane = ControlPlane::new(test_config(), MockFactory::single(state.clone()));
    let session = plane.launch(1).await.unwrap().session_id;
    plane.snapshot(&session, Default::default()).await.unwrap();

    let (a, b, c) = tokio::join!(
        plane.dispatch(&session, click("e1")),
        plane.dispatch(&session, click("e2")),
        plane.dispatch(&session, click("e1")),
    );
    assert!(a.unwrap().success);
    assert!(b.unwrap().success);
    assert!(c.unwrap().success);

    assert_eq!(state.max_in_flight.load(Ordering::SeqCst), 1);

    plane.shutdown().await;
}

#[tokio::test]
async fn different_sessions_run_in_parallel() {
    let state_a = MockState::with_delay(five_element_page(), Duration::from_millis(100));
    let state_b = MockState::with_delay(five_element_page(), Duration::from_millis(100));
    let plane = ControlPlane::new(
        test_config(),
        MockFactory::many(vec![state_a.clone(), state_b.clone()]),
    );
    let a = plane.launch(1).await.unwrap().session_id;
    let b = plane.launch(1).await.unwrap().session_id;

    let started = std::time::Instant::now();
    let (ra, rb) = tokio::join!(
        plane.dispatch(&a, navigate("https://example.com/a")),
        plane.dispatch(&b, navigate("https://example.com/b")),
    );
    assert!(ra.unwrap().success);
    assert!(rb.unwrap().success);
    // Serial execution would need at least 200ms of engine time.
    assert!(started.elapsed() < Duration::from_millis(190));

    plane.shutdown().await;
}

#[tokio::test]
async fn launch_respects_the_session_limit() {
    let states = vec![
        MockState::new(five_element_page()),
        MockState::new(five_element_page()),
    ];
    let mut config = test_config();
    config.session.max_sessions = 1;
    let plane = ControlPlane::new(config, MockFactory::many(states));

    plane.launch(1).await.unwrap();
    let err = plane.launch(1).await.unwrap_err();
    assert_eq!(err.code(), "SESSION_LIMIT");

    plane.shutdown().await;
}

#[tokio::test]
async fn losing_a_launch_race_closes_the_extra_engine() {
    let first = MockState::new(five_element_page());
    let second = MockState::new(five_element_page());
    let mut config = test_config();
    config.session.max_sessions = 1;
    // The launch delay parks both calls past the capacity pre-check, so
    // both engines come up and one must lose at registration.
    let plane = ControlPlane::new(
        config,
        MockFactory::slow(
            vec![first.clone(), second.clone()],
            Duration::from_millis(20),
        ),
    );

    let (a, b) = tokio::join!(plane.launch(1), plane.launch(1));
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let err = outcomes
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one launch must lose");
    assert_eq!(err.code(), "SESSION_LIMIT");

    let closes =
        first.closes.load(Ordering::SeqCst) + second.closes.load(Ordering::SeqCst);
    assert_eq!(closes, 1, "the losing engine must be torn down");

    plane.shutdown().await;
}

#[tokio::test]
async fn timed_out_actions_release_the_session() {
    let state = MockState::new(five_element_page());
    let mut config = test_config();
    config.session.action_timeout_ms = 50;
    let plane = ControlPlane::new(config, MockFactory::single(state.clone()));
    let session = plane.launch(1).await.unwrap().session_id;

    state.stall_next_execute(Duration::from_secs(5));
    let result = plane
        .dispatch(&session, navigate("https://example.com/slow"))
        .await
        .unwrap();
    assert!(!result.success);
    let err = result.error.expect("timeout error");
    assert_eq!(err.code, "ACTION_TIMEOUT");
    assert_eq!(err.recoverability, refbrowse::Recoverability::Recoverable);

    // The lock was released and the session went back to ready, so the
    // next call on the same session goes through.
    let result = plane
        .dispatch(&session, navigate("https://example.com/next"))
        .await
        .unwrap();
    assert!(result.success);

    plane.shutdown().await;
}

#[tokio::test]
async fn unknown_sessions_are_rejected() {
    let plane = ControlPlane::new(
        test_config(),
        MockFactory::single(MockState::new(five_element_page())),
    );
    let err = plane
        .dispatch("nope", click("e1"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SESSION_NOT_FOUND");
    plane.shutdown().await;
}

#[tokio::test]
async fn challenge_detection_sets_and_clears_the_blocked_flag() {
    let state = MockState::new(five_element_page());
    let plane = ControlPlane::new(test_config(), MockFactory::single(state.clone()));
    let session = plane.launch(1).await.unwrap().session_id;
    plane.snapshot(&session, Default::default()).await.unwrap();

    *state.block_next.lock().unwrap() = Some("cloudflare".to_string());
    let blocked = plane.dispatch(&session, click("e1")).await.unwrap();
    assert_eq!(blocked.blocked.as_deref(), Some("cloudflare"));

    let statuses = plane.status();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].blocked.as_deref(), Some("cloudflare"));

    // A clean action clears the flag.
    let clean = plane.dispatch(&session, click("e2")).await.unwrap();
    assert!(clean.success);
    assert!(clean.blocked.is_none());
    assert!(plane.status()[0].blocked.is_none());

    plane.shutdown().await;
}

#[tokio::test]
async fn close_removes_the_session() {
    let state = MockState::new(five_element_page());
    let plane = ControlPlane::new(test_config(), MockFactory::single(state));
    let session = plane.launch(1).await.unwrap().session_id;

    plane.close(&session).await.unwrap();
    let err = plane.dispatch(&session, click("e1")).await.unwrap_err();
    assert_eq!(err.code(), "SESSION_NOT_FOUND");

    plane.shutdown().await;
}
