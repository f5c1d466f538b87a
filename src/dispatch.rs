//! Action dispatch pipeline.
//!
//! One call, seven steps, in a fixed order: resolve the ref against the
//! current table, classify the action, admit state-changing actions through
//! the rate limiter, record the action in the loop detector, run the engine
//! primitive under a timeout, detect document replacement and invalidate
//! refs if it happened, then update the session counters. The caller holds
//! the session lock for the whole call, which is what keeps a session's
//! engine invocations from interleaving.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::{ElementHandle, EngineOutcome, Primitive};
use crate::error::{BrowserError, BrowserResult, ErrorInfo};
use crate::limiter::RateLimiter;
use crate::loopdetect::{self, LoopSeverity};
use crate::session::{Session, SessionState};
use crate::snapshot::parse_ref;

/// Every action the control plane accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Fill,
    Press,
    Hover,
    Select,
    Scroll,
    Back,
    Wait,
    Extract,
    Screenshot,
    Evaluate,
    TabNew,
    TabSwitch,
    TabClose,
}

impl ActionKind {
    /// Read-only actions bypass rate limiting and loop recording.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            ActionKind::Wait | ActionKind::Extract | ActionKind::Screenshot | ActionKind::TabSwitch
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Click => "click",
            ActionKind::Fill => "fill",
            ActionKind::Press => "press",
            ActionKind::Hover => "hover",
            ActionKind::Select => "select",
            ActionKind::Scroll => "scroll",
            ActionKind::Back => "back",
            ActionKind::Wait => "wait",
            ActionKind::Extract => "extract",
            ActionKind::Screenshot => "screenshot",
            ActionKind::Evaluate => "evaluate",
            ActionKind::TabNew => "tab_new",
            ActionKind::TabSwitch => "tab_switch",
            ActionKind::TabClose => "tab_close",
        }
    }
}

/// Free-form action parameters; each kind validates what it needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionParams {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub key: Option<String>,

    #[serde(default)]
    pub value: Option<String>,

    /// Clear the field before filling.
    #[serde(default)]
    pub clear: bool,

    #[serde(default)]
    pub dx: Option<i64>,

    #[serde(default)]
    pub dy: Option<i64>,

    #[serde(default)]
    pub seconds: Option<f64>,

    #[serde(default)]
    pub full_page: bool,

    #[serde(default)]
    pub expression: Option<String>,

    #[serde(default)]
    pub index: Option<usize>,
}

/// One action request against a session.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionRequest {
    pub kind: ActionKind,

    /// Ref token from the current snapshot, e.g. `e3` or `@e3`.
    #[serde(default, rename = "ref")]
    pub ref_token: Option<String>,

    #[serde(default)]
    pub params: ActionParams,
}

/// Structured outcome of one dispatch, success or failure.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    pub page_changed: bool,

    /// Title of the new document, present only when the page changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_title: Option<String>,

    /// Advisory only; never blocks execution.
    pub loop_severity: LoopSeverity,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<f64>,

    pub generation: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ActionResult {
    fn failure(err: &BrowserError, generation: u64) -> Self {
        let wait_seconds = match err {
            BrowserError::RateLimited { wait_seconds, .. } => Some(*wait_seconds),
            _ => None,
        };
        Self {
            success: false,
            content: None,
            page_changed: false,
            new_title: None,
            loop_severity: LoopSeverity::None,
            blocked: None,
            wait_seconds,
            generation,
            error: Some(err.info()),
        }
    }
}

/// Orchestrates the dispatch pipeline over a locked session.
pub struct ActionDispatcher {
    limiter: Arc<RateLimiter>,
    action_timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(limiter: Arc<RateLimiter>, action_timeout: Duration) -> Self {
        Self {
            limiter,
            action_timeout,
        }
    }

    /// Run one action. The caller must hold the session lock.
    pub async fn dispatch(&self, session: &mut Session, request: ActionRequest) -> ActionResult {
        let generation = session.generation;

        if let Err(err) = enter_acting(session) {
            return ActionResult::failure(&err, generation);
        }

        let result = self.run(session, &request).await;

        match &result {
            Ok(_) => leave_acting(session, false),
            Err(err) => leave_acting(session, fatal(err)),
        }

        match result {
            Ok(result) => result,
            Err(err) => {
                debug!(session = %session.id, kind = request.kind.as_str(), code = err.code(), "action failed");
                ActionResult::failure(&err, session.generation)
            }
        }
    }

    async fn run(
        &self,
        session: &mut Session,
        request: &ActionRequest,
    ) -> BrowserResult<ActionResult> {
        // (1) Resolve the ref against the current generation.
        let handle = match &request.ref_token {
            Some(raw) => Some(resolve_ref(session, raw)?),
            None => None,
        };

        // (2) + (3) State-changing actions go through admission control.
        let url_before = session
            .engine
            .current_url()
            .await
            .unwrap_or_else(|_| String::from("about:blank"));
        if !request.kind.is_read_only() {
            let domain = loopdetect::domain_of(url_before_for_admission(
                request,
                &url_before,
            ));
            let admission = self.limiter.admit(&domain);
            if !admission.allowed {
                return Err(BrowserError::RateLimited {
                    domain,
                    wait_seconds: admission.wait_seconds,
                });
            }
        }

        // (4) Record for loop detection; advisory, never a veto.
        let loop_severity = if request.kind.is_read_only() {
            LoopSeverity::None
        } else {
            let signature = action_signature(request.kind, handle.as_ref(), &request.params);
            session.loops.record(&url_before, &signature)
        };

        // (5) Run the primitive under the action timeout.
        let primitive = build_primitive(request, handle)?;
        let outcome = self.execute_bounded(session, primitive).await?;

        // (6) Invalidate refs if the document was replaced.
        let url_after = session
            .engine
            .current_url()
            .await
            .unwrap_or_else(|_| url_before.clone());
        let page_changed = outcome.navigated || url_after != url_before;
        let mut new_title = None;
        if page_changed {
            debug!(session = %session.id, from = %url_before, to = %url_after, "page changed, refs invalidated");
            session.invalidate_refs();
            new_title = session.engine.title().await.ok().filter(|t| !t.is_empty());
        }

        // (7) Bookkeeping. The blocked flag clears on a clean action.
        if page_changed {
            let domain = loopdetect::domain_of(&url_after);
            session.record_domain_visit(&domain);
        }
        session.action_count += 1;
        session.touch();
        match &outcome.blocked {
            Some(kind) => {
                warn!(session = %session.id, challenge = %kind, "protection page detected");
                session.fsm.set_blocked(Some(kind.clone()));
            }
            None => session.fsm.set_blocked(None),
        }

        Ok(ActionResult {
            success: true,
            content: outcome.content,
            page_changed,
            new_title,
            loop_severity,
            blocked: outcome.blocked,
            wait_seconds: None,
            generation: session.generation,
            error: None,
        })
    }

    async fn execute_bounded(
        &self,
        session: &mut Session,
        primitive: Primitive,
    ) -> BrowserResult<EngineOutcome> {
        match tokio::time::timeout(self.action_timeout, session.engine.execute(primitive)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BrowserError::ActionTimeout(
                self.action_timeout.as_millis() as u64
            )),
        }
    }
}

fn enter_acting(session: &mut Session) -> BrowserResult<()> {
    match session.fsm.state() {
        SessionState::Ready => session.fsm.transition(SessionState::Acting),
        SessionState::Crashed | SessionState::Closing | SessionState::Closed => Err(
            BrowserError::EngineUnavailable(format!("session is {}", session.fsm.state().as_str())),
        ),
        other => Err(BrowserError::EngineUnavailable(format!(
            "session not ready ({})",
            other.as_str()
        ))),
    }
}

fn leave_acting(session: &mut Session, crashed: bool) {
    let next = if crashed {
        SessionState::Crashed
    } else {
        SessionState::Ready
    };
    if let Err(err) = session.fsm.transition(next) {
        warn!(session = %session.id, %err, "could not leave acting state");
    }
}

fn fatal(err: &BrowserError) -> bool {
    matches!(err, BrowserError::EngineUnavailable(_))
}

fn resolve_ref(session: &Session, raw: &str) -> BrowserResult<ElementHandle> {
    let token = parse_ref(raw).ok_or_else(|| BrowserError::RefNotFound(raw.to_string()))?;
    session
        .refs
        .as_ref()
        .and_then(|table| table.resolve(token))
        .cloned()
        .ok_or_else(|| BrowserError::RefNotFound(raw.to_string()))
}

/// Domain used for admission: the navigation target for `navigate`, the
/// current page for everything else.
fn url_before_for_admission<'a>(request: &'a ActionRequest, current: &'a str) -> &'a str {
    match (&request.kind, &request.params.url) {
        (ActionKind::Navigate, Some(url)) => url,
        _ => current,
    }
}

/// Normalized signature for loop detection: kind plus salient target
/// identity. Coordinates and literal text count as identity; volatile
/// parts of the URL do not (the detector strips those itself).
pub fn action_signature(
    kind: ActionKind,
    handle: Option<&ElementHandle>,
    params: &ActionParams,
) -> String {
    let mut sig = kind.as_str().to_string();
    if let Some(handle) = handle {
        sig.push(':');
        sig.push_str(&handle.role);
        if let Some(name) = &handle.name {
            sig.push(':');
            sig.push_str(name);
        }
    }
    match kind {
        ActionKind::Navigate => {
            if let Some(url) = &params.url {
                sig.push(':');
                sig.push_str(&loopdetect::url_signature(url));
            }
        }
        ActionKind::Fill => {
            if let Some(text) = &params.text {
                sig.push(':');
                sig.push_str(text);
            }
        }
        ActionKind::Press => {
            if let Some(key) = &params.key {
                sig.push(':');
                sig.push_str(key);
            }
        }
        ActionKind::Select => {
            if let Some(value) = &params.value {
                sig.push(':');
                sig.push_str(value);
            }
        }
        ActionKind::Scroll => {
            sig.push_str(&format!(
                ":{},{}",
                params.dx.unwrap_or(0),
                params.dy.unwrap_or(0)
            ));
        }
        ActionKind::Evaluate => {
            if let Some(expr) = &params.expression {
                sig.push(':');
                sig.push_str(expr);
            }
        }
        _ => {}
    }
    sig
}

fn build_primitive(
    request: &ActionRequest,
    handle: Option<ElementHandle>,
) -> BrowserResult<Primitive> {
    let params = &request.params;
    let target = || handle.clone().ok_or(BrowserError::MissingParam("ref"));
    Ok(match request.kind {
        ActionKind::Navigate => Primitive::Navigate {
            url: params
                .url
                .clone()
                .ok_or(BrowserError::MissingParam("url"))?,
        },
        ActionKind::Click => Primitive::Click { target: target()? },
        ActionKind::Fill => Primitive::Fill {
            target: target()?,
            text: params
                .text
                .clone()
                .ok_or(BrowserError::MissingParam("text"))?,
            clear: params.clear,
        },
        ActionKind::Press => Primitive::Press {
            key: params
                .key
                .clone()
                .ok_or(BrowserError::MissingParam("key"))?,
        },
        ActionKind::Hover => Primitive::Hover { target: target()? },
        ActionKind::Select => Primitive::Select {
            target: target()?,
            value: params
                .value
                .clone()
                .ok_or(BrowserError::MissingParam("value"))?,
        },
        ActionKind::Scroll => Primitive::Scroll {
            dx: params.dx.unwrap_or(0),
            dy: params.dy.unwrap_or(0),
        },
        ActionKind::Back => Primitive::Back,
        ActionKind::Wait => Primitive::Wait {
            seconds: params.seconds.unwrap_or(1.0).clamp(0.0, 30.0),
        },
        ActionKind::Extract => Primitive::ExtractText {
            target: handle.clone(),
        },
        ActionKind::Screenshot => Primitive::Screenshot {
            full_page: params.full_page,
        },
        ActionKind::Evaluate => Primitive::Evaluate {
            expression: params
                .expression
                .clone()
                .ok_or(BrowserError::MissingParam("expression"))?,
        },
        ActionKind::TabNew => Primitive::TabNew {
            url: params.url.clone(),
        },
        ActionKind::TabSwitch => Primitive::TabSwitch {
            index: params.index.ok_or(BrowserError::MissingParam("index"))?,
        },
        ActionKind::TabClose => Primitive::TabClose {
            index: params.index.ok_or(BrowserError::MissingParam("index"))?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(role: &str, name: &str) -> ElementHandle {
        ElementHandle {
            role: role.to_string(),
            name: Some(name.to_string()),
            nth: None,
            selector: None,
        }
    }

    #[test]
    fn read_only_classification() {
        assert!(ActionKind::Wait.is_read_only());
        assert!(ActionKind::Extract.is_read_only());
        assert!(ActionKind::Screenshot.is_read_only());
        assert!(ActionKind::TabSwitch.is_read_only());
        assert!(!ActionKind::Click.is_read_only());
        assert!(!ActionKind::Navigate.is_read_only());
        assert!(!ActionKind::Scroll.is_read_only());
    }

    #[test]
    fn signature_covers_target_identity() {
        let sig = action_signature(
            ActionKind::Click,
            Some(&handle("button", "Save")),
            &ActionParams::default(),
        );
        assert_eq!(sig, "click:button:Save");

        let other = action_signature(
            ActionKind::Click,
            Some(&handle("button", "Cancel")),
            &ActionParams::default(),
        );
        assert_ne!(sig, other);
    }

    #[test]
    fn navigate_signature_ignores_query_noise() {
        let mut params = ActionParams::default();
        params.url = Some("https://example.com/a?session=1".to_string());
        let first = action_signature(ActionKind::Navigate, None, &params);
        params.url = Some("https://example.com/a?session=2".to_string());
        let second = action_signature(ActionKind::Navigate, None, &params);
        assert_eq!(first, second);
    }

    #[test]
    fn fill_signature_includes_text() {
        let mut params = ActionParams::default();
        params.text = Some("hello".to_string());
        let sig = action_signature(ActionKind::Fill, Some(&handle("textbox", "Email")), &params);
        assert_eq!(sig, "fill:textbox:Email:hello");
    }

    #[test]
    fn build_primitive_validates_required_params() {
        let request = ActionRequest {
            kind: ActionKind::Navigate,
            ref_token: None,
            params: ActionParams::default(),
        };
        let err = build_primitive(&request, None).unwrap_err();
        assert!(matches!(err, BrowserError::MissingParam("url")));

        let request = ActionRequest {
            kind: ActionKind::Click,
            ref_token: None,
            params: ActionParams::default(),
        };
        let err = build_primitive(&request, None).unwrap_err();
        assert!(matches!(err, BrowserError::MissingParam("ref")));
    }

    #[test]
    fn wait_seconds_are_clamped() {
        let request = ActionRequest {
            kind: ActionKind::Wait,
            ref_token: None,
            params: ActionParams {
                seconds: Some(500.0),
                ..ActionParams::default()
            },
        };
        match build_primitive(&request, None).unwrap() {
            Primitive::Wait { seconds } => assert_eq!(seconds, 30.0),
            other => panic!("unexpected primitive: {other:?}"),
        }
    }

    #[test]
    fn request_deserializes_with_ref_alias() {
        let request: ActionRequest =
            serde_json::from_str(r#"{"kind":"click","ref":"e3"}"#).unwrap();
        assert_eq!(request.kind, ActionKind::Click);
        assert_eq!(request.ref_token.as_deref(), Some("e3"));
    }
}
