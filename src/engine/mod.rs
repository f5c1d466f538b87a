//! Browser engine capability contract.
//!
//! The control plane never talks to a browser directly: it drives an
//! [`Engine`], a narrow capability trait that any concrete driver can
//! implement. Engines differ in anti-detection posture (see
//! [`CdpEngine`](cdp::CdpEngine) tiers); the control plane is agnostic to
//! which one is active.

pub mod cdp;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BrowserResult;

/// One node of the raw accessibility forest produced by an engine.
///
/// Roles follow ARIA naming (`button`, `link`, `heading`, ...). Nodes that
/// are clickable without a semantic role are flagged `cursor_interactive`
/// and carry a CSS `selector` instead.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RawNode {
    pub role: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub attrs: BTreeMap<String, String>,

    #[serde(default)]
    pub children: Vec<RawNode>,

    #[serde(default)]
    pub cursor_interactive: bool,

    #[serde(default)]
    pub selector: Option<String>,
}

/// Opaque locator descriptor a ref token resolves to.
///
/// The engine decides how to find the element: by CSS selector when one is
/// known, otherwise by role + accessible name, disambiguated by `nth` when
/// the same (role, name) pair occurs more than once in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementHandle {
    pub role: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Occurrence index among elements sharing this role + name.
    #[serde(default)]
    pub nth: Option<usize>,

    #[serde(default)]
    pub selector: Option<String>,
}

/// Low-level input primitive dispatched to an engine.
#[derive(Debug, Clone)]
pub enum Primitive {
    Navigate { url: String },
    Click { target: ElementHandle },
    Fill { target: ElementHandle, text: String, clear: bool },
    Press { key: String },
    Hover { target: ElementHandle },
    Select { target: ElementHandle, value: String },
    Scroll { dx: i64, dy: i64 },
    Back,
    Wait { seconds: f64 },
    ExtractText { target: Option<ElementHandle> },
    Screenshot { full_page: bool },
    Evaluate { expression: String },
    TabNew { url: Option<String> },
    TabSwitch { index: usize },
    TabClose { index: usize },
}

/// What happened when a primitive ran.
#[derive(Debug, Clone, Default)]
pub struct EngineOutcome {
    /// Extracted text, evaluation result, or a short confirmation.
    pub content: Option<String>,

    /// The engine observed a document replacement (navigation, tab change).
    pub navigated: bool,

    /// Protection page detected after the primitive ran (`cloudflare`, ...).
    pub blocked: Option<String>,
}

/// Capability contract every concrete browser driver satisfies.
///
/// All methods may suspend; none may block the executor. Callers bound each
/// invocation with a timeout, so implementations do not need their own
/// deadline handling beyond per-step waits.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Extract the raw accessibility forest of the active document.
    async fn extract_tree(&self, max_depth: usize) -> BrowserResult<Vec<RawNode>>;

    /// Run one input primitive.
    async fn execute(&self, primitive: Primitive) -> BrowserResult<EngineOutcome>;

    /// Cheap liveness probe; `false` means the browser process is gone.
    async fn is_alive(&self) -> bool;

    async fn current_url(&self) -> BrowserResult<String>;

    async fn title(&self) -> BrowserResult<String>;

    async fn tab_count(&self) -> usize;

    /// Tear down the browser. Idempotent.
    async fn close(&self) -> BrowserResult<()>;
}

/// Creates engines at session launch, keyed by stealth tier.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn launch(&self, tier: u8) -> BrowserResult<Box<dyn Engine>>;
}
