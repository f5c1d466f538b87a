//! Accessibility snapshots with stable, generation-scoped refs.
//!
//! The engine hands us a raw role tree; we normalize it in strict document
//! order, hand out sequential ref tokens (`e1..en`) to every interactive or
//! named-content node, and diff the result against the previous generation.
//! Document order is the ordering contract: nodes are never resorted, so a
//! token always denotes the n-th ref-eligible element top to bottom.

pub mod diff;
pub mod refs;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::SnapshotConfig;
use crate::engine::{ElementHandle, RawNode};
pub use diff::{DiffCounts, RemovedNode};
pub use refs::{parse_ref, RefTable, RefToken};

/// Interactive roles: always ref-eligible.
const INTERACTIVE_ROLES: &[&str] = &[
    "button", "link", "textbox", "checkbox", "radio", "combobox", "listbox",
    "menuitem", "option", "searchbox", "slider", "spinbutton", "switch",
    "tab", "treeitem", "menuitemcheckbox", "menuitemradio",
];

/// Content roles: ref-eligible only when they carry an accessible name.
const CONTENT_ROLES: &[&str] = &[
    "heading", "cell", "gridcell", "columnheader", "rowheader", "listitem",
    "article", "region", "main", "navigation", "complementary", "banner",
    "contentinfo", "form", "search", "feed", "figure", "img", "math", "note",
    "status", "timer", "alert", "log", "marquee", "progressbar", "meter",
];

/// Structural roles: skipped in compact mode when nameless, with children
/// hoisted into the parent when any descendant is interactive.
const STRUCTURAL_ROLES: &[&str] = &[
    "generic", "group", "list", "table", "row", "rowgroup", "menu",
    "toolbar", "tablist", "tabpanel", "tree", "treegrid", "grid",
    "presentation", "none", "separator", "dialog", "alertdialog",
    "application", "document", "directory", "paragraph",
];

fn is_interactive(role: &str) -> bool {
    INTERACTIVE_ROLES.contains(&role)
}

fn is_content(role: &str) -> bool {
    CONTENT_ROLES.contains(&role)
}

fn is_structural(role: &str) -> bool {
    STRUCTURAL_ROLES.contains(&role)
}

/// Diff status of a node relative to the immediately preceding generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    New,
    Changed,
    Removed,
    #[default]
    Unchanged,
}

/// One normalized node of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub role: String,
    pub name: Option<String>,
    pub attrs: BTreeMap<String, String>,
    pub ref_token: Option<RefToken>,
    pub status: DiffStatus,
    pub children: Vec<Node>,
}

/// Page identity captured alongside a snapshot.
#[derive(Debug, Clone, Default)]
pub struct PageMeta {
    pub url: String,
    pub title: String,
    pub tab_count: usize,
}

/// An immutable snapshot of one generation. Superseded, never mutated.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub url: String,
    pub title: String,
    pub tab_count: usize,
    pub nodes: Vec<Node>,
    pub removed: Vec<RemovedNode>,
    pub counts: DiffCounts,
    pub text: String,
    pub truncated: bool,
    /// Depth actually used after size degradation.
    pub effective_depth: usize,
}

/// Per-request overrides of the configured snapshot defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotOptions {
    #[serde(default)]
    pub compact: Option<bool>,

    #[serde(default)]
    pub max_depth: Option<usize>,

    #[serde(default)]
    pub cursor_interactive: Option<bool>,
}

/// Builds snapshots and ref tables out of raw accessibility forests.
pub struct SnapshotEngine {
    config: SnapshotConfig,
}

struct BuildState {
    handles: Vec<ElementHandle>,
    occurrences: HashMap<(String, Option<String>), usize>,
}

impl SnapshotEngine {
    pub fn new(config: SnapshotConfig) -> Self {
        Self { config }
    }

    /// Build a new generation from a raw forest, diffed against `prev`.
    ///
    /// When the rendered text exceeds the configured byte cap, depth is
    /// halved (and compaction forced) until the output fits or depth
    /// bottoms out at 2; the result is then flagged `truncated` so the
    /// caller can retry with tighter options instead of failing.
    pub fn build(
        &self,
        raw: &[RawNode],
        meta: PageMeta,
        generation: u64,
        prev: Option<&Snapshot>,
        opts: &SnapshotOptions,
    ) -> (Snapshot, RefTable) {
        let requested_depth = opts.max_depth.unwrap_or(self.config.max_depth).max(1);
        let cursor_interactive = opts
            .cursor_interactive
            .unwrap_or(self.config.cursor_interactive);
        let mut compact = opts.compact.unwrap_or(self.config.compact);
        let mut depth = requested_depth;
        let mut truncated = false;

        loop {
            let mut state = BuildState {
                handles: Vec::new(),
                occurrences: HashMap::new(),
            };
            let mut nodes = normalize(raw, compact, cursor_interactive, depth, 0, &mut state);
            finalize_nth(&mut state.handles);

            let (removed, counts) = match prev {
                Some(prior) => {
                    diff::annotate(&prior.nodes, &mut nodes, &self.config.tracked_attributes)
                }
                // First generation: nothing to diff against.
                None => (Vec::new(), DiffCounts::default()),
            };

            let annotate_diff = prev.is_some();
            let mut text = render(&meta, &nodes, &removed, annotate_diff);
            if text.len() > self.config.max_snapshot_bytes {
                if depth > 2 {
                    depth = (depth / 2).max(2);
                    compact = true;
                    truncated = true;
                    continue;
                }
                truncate_text(&mut text, self.config.max_snapshot_bytes);
                truncated = true;
            }

            let snapshot = Snapshot {
                generation,
                url: meta.url.clone(),
                title: meta.title.clone(),
                tab_count: meta.tab_count,
                nodes,
                removed,
                counts,
                text,
                truncated,
                effective_depth: depth,
            };
            let table = RefTable::new(generation, state.handles);
            return (snapshot, table);
        }
    }
}

/// Normalize one sibling list in document order, assigning ref tokens.
fn normalize(
    raw: &[RawNode],
    compact: bool,
    cursor_interactive: bool,
    max_depth: usize,
    depth: usize,
    state: &mut BuildState,
) -> Vec<Node> {
    let mut out = Vec::new();
    if depth >= max_depth {
        return out;
    }

    for raw_node in raw {
        let role = raw_node.role.to_lowercase();
        let name = raw_node.name.clone().filter(|n| !n.is_empty());

        // Plain text content only survives verbose snapshots.
        if role == "text" {
            if !compact {
                out.push(Node {
                    role,
                    name,
                    attrs: BTreeMap::new(),
                    ref_token: None,
                    status: DiffStatus::Unchanged,
                    children: Vec::new(),
                });
            }
            continue;
        }

        // Compact mode: nameless structural containers disappear; their
        // interactive descendants are hoisted into this sibling list.
        if compact && name.is_none() && is_structural(&role) && !raw_node.cursor_interactive {
            if subtree_has_interactive(raw_node) {
                let mut hoisted = normalize(
                    &raw_node.children,
                    compact,
                    cursor_interactive,
                    max_depth,
                    depth,
                    state,
                );
                out.append(&mut hoisted);
            }
            continue;
        }

        let eligible = is_interactive(&role)
            || (is_content(&role) && name.is_some())
            || (raw_node.cursor_interactive && cursor_interactive);

        let ref_token = if eligible {
            let key = (role.clone(), name.clone());
            let nth = {
                let slot = state.occurrences.entry(key).or_insert(0);
                let current = *slot;
                *slot += 1;
                current
            };
            state.handles.push(ElementHandle {
                role: role.clone(),
                name: name.clone(),
                nth: Some(nth),
                selector: raw_node.selector.clone(),
            });
            Some(RefToken(state.handles.len() as u32))
        } else {
            None
        };

        let children = normalize(
            &raw_node.children,
            compact,
            cursor_interactive,
            max_depth,
            depth + 1,
            state,
        );

        out.push(Node {
            role,
            name,
            attrs: raw_node.attrs.clone(),
            ref_token,
            status: DiffStatus::Unchanged,
            children,
        });
    }
    out
}

fn subtree_has_interactive(node: &RawNode) -> bool {
    node.children.iter().any(|child| {
        let role = child.role.to_lowercase();
        is_interactive(&role)
            || (is_content(&role) && child.name.as_deref().is_some_and(|n| !n.is_empty()))
            || child.cursor_interactive
            || subtree_has_interactive(child)
    })
}

/// Clear the occurrence index on handles whose (role, name) is unique, so
/// engines can resolve them without an nth filter.
fn finalize_nth(handles: &mut [ElementHandle]) {
    let mut counts: HashMap<(String, Option<String>), usize> = HashMap::new();
    for handle in handles.iter() {
        *counts
            .entry((handle.role.clone(), handle.name.clone()))
            .or_insert(0) += 1;
    }
    for handle in handles.iter_mut() {
        let key = (handle.role.clone(), handle.name.clone());
        if counts.get(&key).copied().unwrap_or(0) <= 1 {
            handle.nth = None;
        }
    }
}

fn render(
    meta: &PageMeta,
    nodes: &[Node],
    removed: &[RemovedNode],
    annotate_diff: bool,
) -> String {
    let mut out = format!(
        "Page: {} | Title: {}\nTab 1 of {}\n\n",
        meta.url,
        meta.title,
        meta.tab_count.max(1)
    );
    for node in nodes {
        render_node(node, 0, annotate_diff, &mut out);
    }
    if !removed.is_empty() {
        out.push_str("\nRemoved since previous snapshot:\n");
        for gone in removed {
            match &gone.name {
                Some(name) => out.push_str(&format!("- {} \"{}\"\n", gone.role, name)),
                None => out.push_str(&format!("- {}\n", gone.role)),
            }
        }
    }
    out
}

fn render_node(node: &Node, depth: usize, annotate_diff: bool, out: &mut String) {
    let indent = "  ".repeat(depth);
    out.push_str(&indent);
    out.push_str("- ");
    out.push_str(&node.role);
    if let Some(name) = &node.name {
        out.push_str(&format!(" \"{}\"", name));
    }
    if let Some(token) = node.ref_token {
        out.push_str(&format!(" [{}]", token));
    }
    for (key, value) in &node.attrs {
        out.push_str(&format!(" [{}={}]", key, value));
    }
    if annotate_diff {
        match node.status {
            DiffStatus::New => out.push_str(" (new)"),
            DiffStatus::Changed => out.push_str(" (changed)"),
            _ => {}
        }
    }
    out.push('\n');
    for child in &node.children {
        render_node(child, depth + 1, annotate_diff, out);
    }
}

fn truncate_text(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes.saturating_sub(32);
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n... [truncated]\n");
}
