//! Advisory loop detection over the per-session action history.
//!
//! The detector has no ground truth about task success; it only watches for
//! an agent repeating the same normalized action on the same page. It never
//! vetoes execution — severities are annotations the caller may act on.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use url::Url;

const RING_CAPACITY: usize = 20;
const WARNING_AT: usize = 3;
const STUCK_AT: usize = 5;
const CRITICAL_AT: usize = 7;

/// Escalating advisory severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopSeverity {
    #[default]
    None,
    Warning,
    Stuck,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    url_sig: String,
    action_sig: String,
}

/// Bounded ring of normalized (url, action) signatures for one session.
#[derive(Debug, Default)]
pub struct LoopDetector {
    ring: VecDeque<Entry>,
    last_domain: Option<String>,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one action and report the current severity.
    ///
    /// Always succeeds. The consecutive-repeat counter covers the entry just
    /// recorded, so the first occurrence counts as 1. Crossing to a new
    /// top-level domain clears the history entirely.
    pub fn record(&mut self, url: &str, action_sig: &str) -> LoopSeverity {
        let domain = domain_of(url);
        if self.last_domain.as_deref() != Some(domain.as_str()) {
            self.ring.clear();
            self.last_domain = Some(domain);
        }

        let entry = Entry {
            url_sig: url_signature(url),
            action_sig: action_sig.to_string(),
        };
        if self.ring.len() == RING_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(entry);

        let current = match self.ring.back() {
            Some(e) => e,
            None => return LoopSeverity::None,
        };
        let repeats = self
            .ring
            .iter()
            .rev()
            .take_while(|e| *e == current)
            .count();

        if repeats >= CRITICAL_AT {
            LoopSeverity::Critical
        } else if repeats >= STUCK_AT {
            LoopSeverity::Stuck
        } else if repeats >= WARNING_AT {
            LoopSeverity::Warning
        } else {
            LoopSeverity::None
        }
    }

    pub fn reset(&mut self) {
        self.ring.clear();
        self.last_domain = None;
    }
}

/// Domain + path, with volatile query and fragment dropped.
pub fn url_signature(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => format!(
            "{}{}",
            parsed.host_str().unwrap_or_default(),
            parsed.path()
        ),
        Err(_) => url.to_string(),
    }
}

pub fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .unwrap_or_default()
}
