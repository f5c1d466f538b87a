//! Sliding-window admission control for state-changing actions.
//!
//! One timestamp queue per domain, shared globally across sessions. An
//! action is admitted iff fewer than `limit` admissions happened in the
//! trailing 60-second window; admission appends the timestamp in the same
//! call. Expired entries are pruned lazily, so no background sweep is
//! needed. Read-only actions bypass the limiter entirely (the dispatcher
//! never calls it for them).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::RateLimitConfig;

const WINDOW: Duration = Duration::from_secs(60);

/// Admission decision. `wait_seconds` is 0 when allowed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    pub wait_seconds: f64,
}

/// Global per-domain sliding-window rate limiter.
///
/// Internally synchronized; independent of per-session locks so that
/// admission checks from different sessions never contend on session state.
pub struct RateLimiter {
    limits: RateLimitConfig,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimitConfig) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Limit for a domain: first matching substring pattern, else default.
    fn limit_for(&self, domain: &str) -> u32 {
        for (pattern, limit) in &self.limits.per_domain {
            if domain.contains(pattern.as_str()) {
                return *limit;
            }
        }
        self.limits.default
    }

    /// Decide and record admission for one state-changing action.
    pub fn admit(&self, domain: &str) -> Admission {
        self.admit_at(domain, Instant::now())
    }

    /// Clock-injectable form of [`admit`](Self::admit) for deterministic tests.
    pub fn admit_at(&self, domain: &str, now: Instant) -> Admission {
        let limit = self.limit_for(domain);
        let mut windows = self.windows.lock();
        let window = windows.entry(domain.to_string()).or_default();

        // Lazy prune of entries older than the window.
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if (window.len() as u32) < limit {
            window.push_back(now);
            return Admission {
                allowed: true,
                wait_seconds: 0.0,
            };
        }

        // Oldest entry expires at oldest + 60s.
        let wait = window
            .front()
            .map(|oldest| WINDOW.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or_default();
        Admission {
            allowed: false,
            wait_seconds: wait.as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn limiter(default: u32, per_domain: &[(&str, u32)]) -> RateLimiter {
        let per_domain: HashMap<String, u32> = per_domain
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        RateLimiter::new(RateLimitConfig {
            default,
            per_domain,
        })
    }

    #[test]
    fn admits_up_to_limit_then_denies_with_wait() {
        let limiter = limiter(8, &[("example.com", 2)]);
        let base = Instant::now();

        let a = limiter.admit_at("example.com", base);
        let b = limiter.admit_at("example.com", base + Duration::from_secs(5));
        let c = limiter.admit_at("example.com", base + Duration::from_secs(10));

        assert!(a.allowed);
        assert!(b.allowed);
        assert!(!c.allowed);
        // Oldest admit was at t=0, so the window frees up at t=60.
        assert!((c.wait_seconds - 50.0).abs() < 0.5, "wait={}", c.wait_seconds);
    }

    #[test]
    fn window_frees_after_sixty_seconds() {
        let limiter = limiter(8, &[("example.com", 1)]);
        let base = Instant::now();

        assert!(limiter.admit_at("example.com", base).allowed);
        assert!(!limiter.admit_at("example.com", base + Duration::from_secs(30)).allowed);
        assert!(limiter.admit_at("example.com", base + Duration::from_secs(61)).allowed);
    }

    #[test]
    fn never_exceeds_limit_in_any_trailing_window() {
        let limiter = limiter(8, &[("example.com", 3)]);
        let base = Instant::now();

        let mut admitted: Vec<Duration> = Vec::new();
        for i in 0..240 {
            let offset = Duration::from_secs(i);
            if limiter.admit_at("example.com", base + offset).allowed {
                admitted.push(offset);
            }
        }

        for t in &admitted {
            let in_window = admitted
                .iter()
                .filter(|u| **u > t.saturating_sub(Duration::from_secs(60)) && **u <= *t)
                .count();
            assert!(in_window <= 3, "window ending at {t:?} holds {in_window}");
        }
    }

    #[test]
    fn pattern_match_falls_back_to_default() {
        let limiter = limiter(8, &[("linkedin.com", 4)]);
        assert_eq!(limiter.limit_for("www.linkedin.com"), 4);
        assert_eq!(limiter.limit_for("example.org"), 8);
    }

    #[test]
    fn domains_are_isolated() {
        let limiter = limiter(1, &[]);
        let base = Instant::now();
        assert!(limiter.admit_at("a.com", base).allowed);
        assert!(limiter.admit_at("b.com", base).allowed);
        assert!(!limiter.admit_at("a.com", base + Duration::from_secs(1)).allowed);
    }
}
