//! Ref tokens and the per-generation ref table.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::ElementHandle;

/// Symbolic handle to one element, valid only within the snapshot
/// generation that produced it. Printed as `e1`, `e2`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefToken(pub u32);

impl fmt::Display for RefToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Parse a ref argument into its canonical token.
///
/// Accepts `@e1`, `ref=e1`, and `e1`.
pub fn parse_ref(raw: &str) -> Option<RefToken> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix('@')
        .or_else(|| trimmed.strip_prefix("ref="))
        .unwrap_or(trimmed);
    let digits = body.strip_prefix('e')?;
    digits.parse::<u32>().ok().filter(|n| *n >= 1).map(RefToken)
}

/// Mapping from ref tokens to element handles, scoped to one generation.
///
/// Tokens are dense (`e1..en`), so storage is positional. A table is never
/// mutated after construction except to be marked stale; the next snapshot
/// replaces it wholesale.
#[derive(Debug, Clone)]
pub struct RefTable {
    generation: u64,
    handles: Vec<ElementHandle>,
    stale: bool,
}

impl RefTable {
    pub fn new(generation: u64, handles: Vec<ElementHandle>) -> Self {
        Self {
            generation,
            handles,
            stale: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Invalidate every token in this table. Done when the page changed
    /// out from under the snapshot, before a new generation exists.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Resolve a token to its handle. Stale tables resolve nothing.
    pub fn resolve(&self, token: RefToken) -> Option<&ElementHandle> {
        if self.stale {
            return None;
        }
        self.handles.get((token.0 as usize).checked_sub(1)?)
    }

    /// Tokens with their handles, in assignment order.
    pub fn entries(&self) -> impl Iterator<Item = (RefToken, &ElementHandle)> {
        self.handles
            .iter()
            .enumerate()
            .map(|(i, h)| (RefToken(i as u32 + 1), h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(role: &str) -> ElementHandle {
        ElementHandle {
            role: role.to_string(),
            name: None,
            nth: None,
            selector: None,
        }
    }

    #[test]
    fn parse_accepts_all_forms() {
        assert_eq!(parse_ref("@e3"), Some(RefToken(3)));
        assert_eq!(parse_ref("ref=e12"), Some(RefToken(12)));
        assert_eq!(parse_ref("e1"), Some(RefToken(1)));
        assert_eq!(parse_ref("e0"), None);
        assert_eq!(parse_ref("button"), None);
        assert_eq!(parse_ref("@x1"), None);
    }

    #[test]
    fn resolve_is_positional_and_one_based() {
        let table = RefTable::new(1, vec![handle("button"), handle("link")]);
        assert_eq!(table.resolve(RefToken(1)).map(|h| h.role.as_str()), Some("button"));
        assert_eq!(table.resolve(RefToken(2)).map(|h| h.role.as_str()), Some("link"));
        assert!(table.resolve(RefToken(3)).is_none());
    }

    #[test]
    fn stale_table_resolves_nothing() {
        let mut table = RefTable::new(1, vec![handle("button")]);
        assert!(table.resolve(RefToken(1)).is_some());
        table.mark_stale();
        assert!(table.resolve(RefToken(1)).is_none());
    }
}
