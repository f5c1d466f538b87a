//! Chromiumoxide-backed engine.
//!
//! Three stealth tiers share one implementation: tier 1 is plain headless
//! Chrome, tier 2 adds anti-automation launch flags, tier 3 runs the
//! stealth profile headed. Element resolution prefers the CSS selector
//! captured at snapshot time and falls back to an in-page scan by role,
//! accessible name and occurrence index.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::config::BrowserConfig as BrowserSettings;
use crate::engine::{ElementHandle, Engine, EngineFactory, EngineOutcome, Primitive, RawNode};
use crate::error::{BrowserError, BrowserResult};

const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Marker attribute used to hand elements from in-page scans back to CDP.
const TARGET_ATTR: &str = "data-cdp-target";

/// In-page accessibility walk. Produces the raw forest the snapshot engine
/// normalizes: role, accessible name, tracked attributes, cursor-pointer
/// flag and a best-effort CSS selector per node.
const EXTRACT_SCRIPT: &str = r#"
(() => {
  const ROLE_BY_TAG = {
    a: 'link', button: 'button', select: 'combobox', textarea: 'textbox',
    h1: 'heading', h2: 'heading', h3: 'heading', h4: 'heading',
    h5: 'heading', h6: 'heading', img: 'img', nav: 'navigation',
    main: 'main', header: 'banner', footer: 'contentinfo', form: 'form',
    article: 'article', aside: 'complementary', section: 'region',
    li: 'listitem', ul: 'list', ol: 'list', table: 'table', tr: 'row',
    td: 'cell', th: 'columnheader', option: 'option', dialog: 'dialog',
    p: 'paragraph',
  };
  const INPUT_ROLES = {
    checkbox: 'checkbox', radio: 'radio', button: 'button',
    submit: 'button', reset: 'button', range: 'slider',
    number: 'spinbutton', search: 'searchbox',
  };

  function roleOf(el) {
    const explicit = el.getAttribute('role');
    if (explicit) return explicit.toLowerCase();
    const tag = el.tagName.toLowerCase();
    if (tag === 'input') {
      return INPUT_ROLES[(el.getAttribute('type') || 'text').toLowerCase()] || 'textbox';
    }
    return ROLE_BY_TAG[tag] || 'generic';
  }

  function nameOf(el) {
    const aria = el.getAttribute('aria-label');
    if (aria) return aria.trim();
    const labelled = el.getAttribute('aria-labelledby');
    if (labelled) {
      const target = document.getElementById(labelled.split(/\s+/)[0]);
      if (target) return target.textContent.trim().slice(0, 120);
    }
    const tag = el.tagName.toLowerCase();
    if (tag === 'img') return (el.getAttribute('alt') || '').trim();
    if (tag === 'input' || tag === 'textarea' || tag === 'select') {
      if (el.labels && el.labels.length) return el.labels[0].textContent.trim().slice(0, 120);
      return (el.getAttribute('placeholder') || el.getAttribute('name') || '').trim();
    }
    const text = (el.textContent || '').trim().replace(/\s+/g, ' ');
    return text.slice(0, 120);
  }

  function attrsOf(el) {
    const attrs = {};
    for (const key of ['checked', 'disabled', 'selected']) {
      if (el[key] === true) attrs[key] = 'true';
    }
    for (const key of ['aria-pressed', 'aria-checked', 'aria-expanded', 'aria-selected']) {
      const value = el.getAttribute(key);
      if (value !== null) attrs[key.slice(5)] = value;
    }
    const tag = el.tagName.toLowerCase();
    if (/^h[1-6]$/.test(tag)) attrs.level = tag.slice(1);
    const level = el.getAttribute('aria-level');
    if (level !== null) attrs.level = level;
    if ((tag === 'input' || tag === 'textarea' || tag === 'select') && el.value) {
      attrs.value = String(el.value).slice(0, 60);
    }
    return attrs;
  }

  function selectorOf(el) {
    if (el.id) return '#' + CSS.escape(el.id);
    const name = el.getAttribute('name');
    if (name) {
      return el.tagName.toLowerCase() + '[name=' + JSON.stringify(name) + ']';
    }
    const parts = [];
    let node = el;
    while (node && node.nodeType === 1 && parts.length < 6) {
      let part = node.tagName.toLowerCase();
      const parent = node.parentElement;
      if (parent) {
        const same = Array.from(parent.children).filter((c) => c.tagName === node.tagName);
        if (same.length > 1) part += ':nth-of-type(' + (same.indexOf(node) + 1) + ')';
      }
      parts.unshift(part);
      if (node.id) {
        parts[0] = '#' + CSS.escape(node.id);
        break;
      }
      node = parent;
    }
    return parts.join(' > ');
  }

  function cursorInteractive(el, role) {
    if (role !== 'generic') return false;
    if (!el.onclick && el.getAttribute('tabindex') === null
        && !el.hasAttribute('onclick')) {
      const style = window.getComputedStyle(el);
      if (style.cursor !== 'pointer') return false;
    }
    const rect = el.getBoundingClientRect();
    return rect.width > 0 && rect.height > 0;
  }

  function visible(el) {
    const style = window.getComputedStyle(el);
    return style.display !== 'none' && style.visibility !== 'hidden';
  }

  const SKIP_TAGS = new Set(['script', 'style', 'noscript', 'template', 'link', 'meta', 'head', 'svg']);

  function walk(el, depth) {
    if (depth > __MAX_DEPTH__) return [];
    const out = [];
    for (const child of el.children) {
      const tag = child.tagName.toLowerCase();
      if (SKIP_TAGS.has(tag) || !visible(child)) continue;
      const role = roleOf(child);
      const interactive = cursorInteractive(child, role);
      const node = {
        role: role,
        name: nameOf(child) || null,
        attrs: attrsOf(child),
        children: walk(child, depth + 1),
        cursor_interactive: interactive,
        selector: null,
      };
      if (role !== 'generic' || interactive || node.children.length) {
        if (role !== 'generic' || interactive) node.selector = selectorOf(child);
        out.push(node);
      }
    }
    return out;
  }

  return walk(document.body || document.documentElement, 0);
})()
"#;

/// Chrome driven over the DevTools protocol.
pub struct CdpEngine {
    browser: Mutex<Option<Browser>>,
    page: Mutex<Page>,
    handler: Mutex<Option<JoinHandle<()>>>,
    user_data_dir: Mutex<Option<PathBuf>>,
}

/// Launches [`CdpEngine`]s, one browser process per session.
pub struct CdpEngineFactory {
    settings: BrowserSettings,
}

impl CdpEngineFactory {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl EngineFactory for CdpEngineFactory {
    async fn launch(&self, tier: u8) -> BrowserResult<Box<dyn Engine>> {
        if !(1..=3).contains(&tier) {
            return Err(BrowserError::UnknownTier(tier));
        }

        let chrome_path = find_browser_executable()
            .map_err(|err| BrowserError::EngineUnavailable(err.to_string()))?;
        let user_data_dir = std::env::temp_dir().join(format!(
            "refbrowse_{}_{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&user_data_dir)
            .map_err(|err| BrowserError::EngineUnavailable(err.to_string()))?;

        let headless = tier < 3 && self.settings.headless;
        let mut builder = BrowserConfigBuilder::default()
            .request_timeout(Duration::from_secs(30))
            .window_size(self.settings.window_width, self.settings.window_height)
            .user_data_dir(&user_data_dir)
            .chrome_executable(chrome_path)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--mute-audio");

        if headless {
            builder = builder.headless_mode(HeadlessMode::default());
        } else {
            builder = builder.with_head();
        }

        if tier >= 2 {
            builder = builder
                .arg(format!("--user-agent={CHROME_USER_AGENT}"))
                .arg("--disable-blink-features=AutomationControlled")
                .arg("--disable-extensions")
                .arg("--disable-background-networking")
                .arg("--disable-background-timer-throttling")
                .arg("--disable-breakpad")
                .arg("--disable-hang-monitor")
                .arg("--disable-ipc-flooding-protection")
                .arg("--disable-prompt-on-repost")
                .arg("--metrics-recording-only")
                .arg("--password-store=basic")
                .arg("--use-mock-keychain")
                .arg("--hide-scrollbars");
        }

        if should_disable_sandbox() {
            info!("containerized environment detected, disabling sandbox");
            builder = builder.arg("--no-sandbox").arg("--disable-setuid-sandbox");
        }

        let browser_config = builder
            .build()
            .map_err(|err| BrowserError::EngineUnavailable(format!("browser config: {err}")))?;

        info!(tier, headless, "launching browser");
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|err| BrowserError::EngineUnavailable(err.to_string()))?;

        let handler_task = task::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    let message = err.to_string();
                    // Chrome emits CDP events chromiumoxide cannot decode;
                    // those are noise, not faults.
                    let benign = message
                        .contains("data did not match any variant of untagged enum Message")
                        || message.contains("Failed to deserialize WS response");
                    if benign {
                        trace!("suppressed benign CDP serialization error: {message}");
                    } else {
                        error!("browser handler error: {message}");
                    }
                }
            }
            debug!("browser handler task finished");
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|err| BrowserError::EngineUnavailable(err.to_string()))?;

        Ok(Box::new(CdpEngine {
            browser: Mutex::new(Some(browser)),
            page: Mutex::new(page),
            handler: Mutex::new(Some(handler_task)),
            user_data_dir: Mutex::new(Some(user_data_dir)),
        }))
    }
}

#[async_trait]
impl Engine for CdpEngine {
    async fn extract_tree(&self, max_depth: usize) -> BrowserResult<Vec<RawNode>> {
        let page = self.page.lock().await.clone();
        let script = EXTRACT_SCRIPT.replace("__MAX_DEPTH__", &max_depth.to_string());
        let forest: Vec<RawNode> = page
            .evaluate(script)
            .await
            .map_err(cdp_err)?
            .into_value()
            .map_err(|err| BrowserError::Engine(format!("tree decode: {err}")))?;
        Ok(forest)
    }

    async fn execute(&self, primitive: Primitive) -> BrowserResult<EngineOutcome> {
        let page = self.page.lock().await.clone();
        match primitive {
            Primitive::Navigate { url } => {
                page.goto(&url).await.map_err(cdp_err)?;
                if let Err(err) = page.wait_for_navigation().await {
                    debug!(%url, %err, "wait_for_navigation after goto failed");
                }
                Ok(EngineOutcome {
                    content: None,
                    navigated: true,
                    blocked: detect_block(&page).await,
                })
            }
            Primitive::Click { target } => {
                let element = self.locate(&page, &target).await?;
                element.scroll_into_view().await.map_err(cdp_err)?;
                let point = element.clickable_point().await.map_err(cdp_err)?;
                page.click(point).await.map_err(cdp_err)?;
                // Give a same-document click time to settle; a navigating
                // click is caught by the caller's URL comparison.
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(EngineOutcome {
                    content: None,
                    navigated: false,
                    blocked: detect_block(&page).await,
                })
            }
            Primitive::Fill {
                target,
                text,
                clear,
            } => {
                let element = self.locate(&page, &target).await?;
                element.scroll_into_view().await.map_err(cdp_err)?;
                let point = element.clickable_point().await.map_err(cdp_err)?;
                page.click(point).await.map_err(cdp_err)?;
                if clear {
                    element
                        .call_js_fn("function() { this.value = ''; }", false)
                        .await
                        .map_err(cdp_err)?;
                }
                element.type_str(&text).await.map_err(cdp_err)?;
                Ok(EngineOutcome::default())
            }
            Primitive::Press { key } => {
                let script = format!(
                    "(() => {{ const key = {key_json}; \
                       const el = document.activeElement || document.body; \
                       for (const kind of ['keydown', 'keypress', 'keyup']) {{ \
                         el.dispatchEvent(new KeyboardEvent(kind, {{ key, bubbles: true }})); \
                       }} \
                       if (key === 'Enter' && el.form) el.form.requestSubmit(); \
                     }})()",
                    key_json = serde_json::to_string(&key).unwrap_or_default()
                );
                page.evaluate(script).await.map_err(cdp_err)?;
                Ok(EngineOutcome::default())
            }
            Primitive::Hover { target } => {
                let element = self.locate(&page, &target).await?;
                element.scroll_into_view().await.map_err(cdp_err)?;
                element
                    .call_js_fn(
                        "function() { \
                           for (const kind of ['mouseenter', 'mouseover', 'mousemove']) { \
                             this.dispatchEvent(new MouseEvent(kind, { bubbles: true })); \
                           } \
                         }",
                        false,
                    )
                    .await
                    .map_err(cdp_err)?;
                Ok(EngineOutcome::default())
            }
            Primitive::Select { target, value } => {
                let element = self.locate(&page, &target).await?;
                let script = format!(
                    "function() {{ this.value = {value_json}; \
                       this.dispatchEvent(new Event('input', {{ bubbles: true }})); \
                       this.dispatchEvent(new Event('change', {{ bubbles: true }})); }}",
                    value_json = serde_json::to_string(&value).unwrap_or_default()
                );
                element.call_js_fn(&script, false).await.map_err(cdp_err)?;
                Ok(EngineOutcome::default())
            }
            Primitive::Scroll { dx, dy } => {
                page.evaluate(format!("window.scrollBy({dx}, {dy})"))
                    .await
                    .map_err(cdp_err)?;
                Ok(EngineOutcome::default())
            }
            Primitive::Back => {
                page.evaluate("history.back()").await.map_err(cdp_err)?;
                if let Err(err) = page.wait_for_navigation().await {
                    debug!(%err, "wait_for_navigation after back failed");
                }
                Ok(EngineOutcome {
                    content: None,
                    navigated: true,
                    blocked: detect_block(&page).await,
                })
            }
            Primitive::Wait { seconds } => {
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                Ok(EngineOutcome::default())
            }
            Primitive::ExtractText { target } => {
                let content = match target {
                    Some(handle) => {
                        let element = self.locate(&page, &handle).await?;
                        element.inner_text().await.map_err(cdp_err)?.unwrap_or_default()
                    }
                    None => page
                        .evaluate("document.body.innerText")
                        .await
                        .map_err(cdp_err)?
                        .into_value::<String>()
                        .unwrap_or_default(),
                };
                Ok(EngineOutcome {
                    content: Some(content),
                    ..EngineOutcome::default()
                })
            }
            Primitive::Screenshot { full_page } => {
                let params = ScreenshotParams::builder().full_page(full_page).build();
                let bytes = page.screenshot(params).await.map_err(cdp_err)?;
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                Ok(EngineOutcome {
                    content: Some(encoded),
                    ..EngineOutcome::default()
                })
            }
            Primitive::Evaluate { expression } => {
                let value = page
                    .evaluate(expression)
                    .await
                    .map_err(cdp_err)?
                    .into_value::<serde_json::Value>()
                    .unwrap_or(serde_json::Value::Null);
                Ok(EngineOutcome {
                    content: Some(value.to_string()),
                    ..EngineOutcome::default()
                })
            }
            Primitive::TabNew { url } => {
                let target = url.as_deref().unwrap_or("about:blank");
                let new_page = {
                    let guard = self.browser.lock().await;
                    let browser = guard
                        .as_ref()
                        .ok_or_else(|| BrowserError::EngineUnavailable("browser closed".into()))?;
                    browser.new_page(target).await.map_err(cdp_err)?
                };
                *self.page.lock().await = new_page;
                Ok(EngineOutcome {
                    content: None,
                    navigated: true,
                    blocked: None,
                })
            }
            Primitive::TabSwitch { index } => {
                let target = self.page_at(index).await?;
                *self.page.lock().await = target;
                Ok(EngineOutcome {
                    content: None,
                    navigated: true,
                    blocked: None,
                })
            }
            Primitive::TabClose { index } => {
                let target = self.page_at(index).await?;
                let closing_active = {
                    let active = self.page.lock().await;
                    active.target_id() == target.target_id()
                };
                target.close().await.map_err(cdp_err)?;
                if closing_active {
                    let replacement = self.page_at(0).await?;
                    *self.page.lock().await = replacement;
                }
                Ok(EngineOutcome {
                    content: None,
                    navigated: closing_active,
                    blocked: None,
                })
            }
        }
    }

    async fn is_alive(&self) -> bool {
        let guard = self.browser.lock().await;
        match guard.as_ref() {
            Some(browser) => browser.version().await.is_ok(),
            None => false,
        }
    }

    async fn current_url(&self) -> BrowserResult<String> {
        let page = self.page.lock().await.clone();
        let url = page.url().await.map_err(cdp_err)?;
        Ok(url.unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn title(&self) -> BrowserResult<String> {
        let page = self.page.lock().await.clone();
        let title: String = page
            .evaluate("document.title")
            .await
            .map_err(cdp_err)?
            .into_value()
            .unwrap_or_default();
        Ok(title)
    }

    async fn tab_count(&self) -> usize {
        let guard = self.browser.lock().await;
        match guard.as_ref() {
            Some(browser) => browser.pages().await.map(|p| p.len()).unwrap_or(1),
            None => 0,
        }
    }

    async fn close(&self) -> BrowserResult<()> {
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(err) = browser.close().await {
                warn!(%err, "browser close failed");
            }
            if let Err(err) = browser.wait().await {
                warn!(%err, "browser wait failed");
            }
        }
        if let Some(handler) = self.handler.lock().await.take() {
            handler.abort();
        }
        // Chrome must be fully gone before the profile dir is removed.
        if let Some(dir) = self.user_data_dir.lock().await.take() {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), %err, "could not remove profile dir");
            }
        }
        Ok(())
    }
}

impl CdpEngine {
    /// Resolve a handle to a live element: by stored selector first, then by
    /// an in-page scan over role + accessible name + occurrence index.
    async fn locate(&self, page: &Page, handle: &ElementHandle) -> BrowserResult<Element> {
        if let Some(selector) = &handle.selector {
            if let Ok(element) = wait_for_element(page, selector, Duration::from_secs(5)).await {
                return Ok(element);
            }
            debug!(selector, "stored selector missed, falling back to role scan");
        }

        let script = format!(
            r#"(() => {{
  const wantRole = {role};
  const wantName = {name};
  const wantNth = {nth};
  document.querySelectorAll('[{attr}]').forEach((el) => el.removeAttribute('{attr}'));
  const ROLE_BY_TAG = {{
    a: 'link', button: 'button', select: 'combobox', textarea: 'textbox',
    h1: 'heading', h2: 'heading', h3: 'heading', h4: 'heading',
    h5: 'heading', h6: 'heading', img: 'img', li: 'listitem',
    td: 'cell', th: 'columnheader', option: 'option',
  }};
  function roleOf(el) {{
    const explicit = el.getAttribute('role');
    if (explicit) return explicit.toLowerCase();
    const tag = el.tagName.toLowerCase();
    if (tag === 'input') {{
      const type = (el.getAttribute('type') || 'text').toLowerCase();
      if (type === 'checkbox' || type === 'radio') return type;
      if (type === 'submit' || type === 'button' || type === 'reset') return 'button';
      return 'textbox';
    }}
    return ROLE_BY_TAG[tag] || 'generic';
  }}
  function nameOf(el) {{
    const aria = el.getAttribute('aria-label');
    if (aria) return aria.trim();
    const tag = el.tagName.toLowerCase();
    if (tag === 'img') return (el.getAttribute('alt') || '').trim();
    if (tag === 'input' || tag === 'textarea' || tag === 'select') {{
      if (el.labels && el.labels.length) return el.labels[0].textContent.trim().slice(0, 120);
      return (el.getAttribute('placeholder') || el.getAttribute('name') || '').trim();
    }}
    return (el.textContent || '').trim().replace(/\s+/g, ' ').slice(0, 120);
  }}
  let seen = 0;
  for (const el of document.querySelectorAll('*')) {{
    if (roleOf(el) !== wantRole) continue;
    if (wantName !== null && nameOf(el) !== wantName) continue;
    if (seen === wantNth) {{
      el.setAttribute('{attr}', '1');
      return true;
    }}
    seen += 1;
  }}
  return false;
}})()"#,
            role = serde_json::to_string(&handle.role).unwrap_or_default(),
            name = serde_json::to_string(&handle.name).unwrap_or_default(),
            nth = handle.nth.unwrap_or(0),
            attr = TARGET_ATTR,
        );

        let found: bool = page
            .evaluate(script)
            .await
            .map_err(cdp_err)?
            .into_value()
            .unwrap_or(false);
        if !found {
            return Err(BrowserError::RefNotFound(describe(handle)));
        }
        let element = page
            .find_element(format!("[{TARGET_ATTR}]"))
            .await
            .map_err(cdp_err)?;
        // Leave the DOM the way we found it.
        let _ = element
            .call_js_fn(
                &format!("function() {{ this.removeAttribute('{TARGET_ATTR}'); }}"),
                false,
            )
            .await;
        Ok(element)
    }

    async fn page_at(&self, index: usize) -> BrowserResult<Page> {
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| BrowserError::EngineUnavailable("browser closed".into()))?;
        let pages = browser.pages().await.map_err(cdp_err)?;
        pages
            .get(index)
            .cloned()
            .ok_or_else(|| BrowserError::Engine(format!("no tab at index {index}")))
    }
}

fn describe(handle: &ElementHandle) -> String {
    match &handle.name {
        Some(name) => format!("{} \"{}\"", handle.role, name),
        None => handle.role.clone(),
    }
}

/// Map a CDP transport failure to the taxonomy: a dead connection is a dead
/// session, everything else is a plain engine error.
fn cdp_err(err: impl std::fmt::Display) -> BrowserError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("connection")
        || lower.contains("channel closed")
        || lower.contains("browser closed")
        || lower.contains("target closed")
    {
        BrowserError::EngineUnavailable(message)
    } else {
        BrowserError::Engine(message)
    }
}

/// Protection-page markers, checked against title and visible text.
async fn detect_block(page: &Page) -> Option<String> {
    let probe: String = page
        .evaluate(
            "document.title + '\\n' + \
             (document.body ? document.body.innerText.slice(0, 2000) : '')",
        )
        .await
        .ok()?
        .into_value()
        .ok()?;
    classify_block(&probe)
}

fn classify_block(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let title = lower.lines().next().unwrap_or("");
    if title.contains("just a moment") || title.contains("attention required") {
        return Some("cloudflare".to_string());
    }
    if lower.contains("datadome") {
        return Some("datadome".to_string());
    }
    if title.contains("access denied") || lower.contains("px-captcha") {
        return Some("perimeterx".to_string());
    }
    if lower.contains("captcha") || lower.contains("verify you are human") {
        return Some("captcha".to_string());
    }
    None
}

/// Poll for an element with exponential backoff; SPAs render after load.
async fn wait_for_element(
    page: &Page,
    selector: &str,
    timeout: Duration,
) -> BrowserResult<Element> {
    let start = std::time::Instant::now();
    let mut poll_interval = Duration::from_millis(100);
    let max_interval = Duration::from_secs(1);

    loop {
        if let Ok(element) = page.find_element(selector).await {
            return Ok(element);
        }
        if start.elapsed() >= timeout {
            return Err(BrowserError::RefNotFound(format!(
                "selector '{selector}' not found after {}ms",
                timeout.as_millis()
            )));
        }
        tokio::time::sleep(poll_interval).await;
        poll_interval = (poll_interval * 2).min(max_interval);
    }
}

/// Find a Chrome or Chromium binary on this machine.
fn find_browser_executable() -> BrowserResult<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        warn!(path = %path.display(), "CHROMIUM_PATH points at a missing file");
    }

    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };
    for candidate in candidates {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Ok(path);
        }
    }

    for cmd in ["chromium", "chromium-browser", "google-chrome", "chrome"] {
        if let Ok(output) = Command::new("which").arg(cmd).output() {
            if output.status.success() {
                let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !found.is_empty() {
                    return Ok(PathBuf::from(found));
                }
            }
        }
    }

    Err(BrowserError::EngineUnavailable(
        "no Chrome/Chromium executable found (set CHROMIUM_PATH)".to_string(),
    ))
}

/// Containers cannot use the setuid sandbox.
fn should_disable_sandbox() -> bool {
    std::path::Path::new("/.dockerenv").exists()
        || std::env::var("container").is_ok()
        || std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
}
