//! Generation-to-generation tree diff.
//!
//! Element handles are not stable across generations, so nodes are matched
//! by a structural key instead: role + accessible name + occurrence index
//! within the sibling list. Matching is per sibling list and recursive, so
//! a moved subtree matches its counterpart as long as the path of keys
//! agrees. Removed nodes are collected into a side list, never inlined.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{DiffStatus, Node};

/// A node present in the prior generation with no match in the current one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemovedNode {
    pub role: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffCounts {
    pub new: usize,
    pub changed: usize,
    pub removed: usize,
}

/// Annotate `next` with diff statuses relative to `prev`.
///
/// `tracked` is the attribute list whose changes mark a matched node as
/// `Changed`; attributes outside it are ignored by the diff.
pub fn annotate(
    prev: &[Node],
    next: &mut [Node],
    tracked: &[String],
) -> (Vec<RemovedNode>, DiffCounts) {
    let mut removed = Vec::new();
    let mut counts = DiffCounts::default();
    diff_siblings(prev, next, tracked, &mut removed, &mut counts);
    (removed, counts)
}

fn key_of(node: &Node) -> (String, Option<String>) {
    (node.role.clone(), node.name.clone())
}

fn diff_siblings(
    prev: &[Node],
    next: &mut [Node],
    tracked: &[String],
    removed: &mut Vec<RemovedNode>,
    counts: &mut DiffCounts,
) {
    // Index prior siblings by (key, occurrence).
    let mut prev_by_key: HashMap<(String, Option<String>), Vec<&Node>> = HashMap::new();
    for node in prev {
        prev_by_key.entry(key_of(node)).or_default().push(node);
    }

    let mut seen: HashMap<(String, Option<String>), usize> = HashMap::new();
    for node in next.iter_mut() {
        let key = key_of(node);
        let occurrence = {
            let slot = seen.entry(key.clone()).or_insert(0);
            let current = *slot;
            *slot += 1;
            current
        };

        match prev_by_key.get(&key).and_then(|v| v.get(occurrence)) {
            Some(prior) => {
                node.status = if tracked_attrs_differ(prior, node, tracked) {
                    counts.changed += 1;
                    DiffStatus::Changed
                } else {
                    DiffStatus::Unchanged
                };
                diff_siblings(&prior.children, &mut node.children, tracked, removed, counts);
            }
            None => {
                mark_new(node, counts);
            }
        }
    }

    // Prior siblings beyond the matched occurrences are removed.
    let mut next_seen: HashMap<(String, Option<String>), usize> = HashMap::new();
    for node in next.iter() {
        *next_seen.entry(key_of(node)).or_insert(0) += 1;
    }
    let mut prev_seen: HashMap<(String, Option<String>), usize> = HashMap::new();
    for node in prev {
        let key = key_of(node);
        let occurrence = {
            let slot = prev_seen.entry(key.clone()).or_insert(0);
            let current = *slot;
            *slot += 1;
            current
        };
        if occurrence >= next_seen.get(&key).copied().unwrap_or(0) {
            collect_removed(node, removed, counts);
        }
    }
}

fn tracked_attrs_differ(prev: &Node, next: &Node, tracked: &[String]) -> bool {
    tracked
        .iter()
        .any(|attr| prev.attrs.get(attr) != next.attrs.get(attr))
}

fn mark_new(node: &mut Node, counts: &mut DiffCounts) {
    node.status = DiffStatus::New;
    counts.new += 1;
    for child in &mut node.children {
        mark_new(child, counts);
    }
}

fn collect_removed(node: &Node, removed: &mut Vec<RemovedNode>, counts: &mut DiffCounts) {
    removed.push(RemovedNode {
        role: node.role.clone(),
        name: node.name.clone(),
    });
    counts.removed += 1;
    for child in &node.children {
        collect_removed(child, removed, counts);
    }
}
