//! Per-PR review cooldown gate.
//!
//! A process-local table keyed by `(org, project, repo, pr)` that
//! rejects review requests landing inside the configured cooldown
//! window. This is the only process-wide mutable state in the
//! service; concurrent `check`/`record` from in-flight requests is
//! coordinated by a single mutex.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Entries older than this are eligible for eviction.
const STALE_ENTRY_HOURS: i64 = 24;

/// Roughly one in this many `check` calls triggers an eviction sweep.
const EVICTION_ROLL: u32 = 100;

/// Cooldown key: org, project, repo and PR id, normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GateKey {
    org: String,
    project: String,
    repo: String,
    pr_id: i64,
}

impl GateKey {
    pub fn new(org: &str, project: &str, repo: &str, pr_id: i64) -> Self {
        Self {
            org: org.to_lowercase(),
            project: project.to_lowercase(),
            repo: repo.to_lowercase(),
            pr_id,
        }
    }
}

impl std::fmt::Display for GateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}/{}", self.org, self.project, self.repo, self.pr_id)
    }
}

/// Result of a gate check.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub allowed: bool,
    /// Seconds until the cooldown expires (0 when allowed).
    pub seconds_remaining: u64,
    /// When this PR was last reviewed, if known.
    pub last_reviewed_at: Option<DateTime<Utc>>,
}

impl GateDecision {
    fn allow(last_reviewed_at: Option<DateTime<Utc>>) -> Self {
        Self {
            allowed: true,
            seconds_remaining: 0,
            last_reviewed_at,
        }
    }
}

/// Process-lifetime cooldown map for reviewed PRs.
pub struct RateGate {
    entries: Mutex<HashMap<GateKey, DateTime<Utc>>>,
}

impl RateGate {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether a review of `key` is allowed under the given
    /// minimum interval. An interval of zero (or negative) disables
    /// the gate entirely.
    ///
    /// Roughly every hundredth call also sweeps entries older than
    /// 24 hours; a `record` racing the sweep simply re-inserts.
    pub fn check(&self, key: &GateKey, interval_minutes: i64) -> GateDecision {
        if interval_minutes <= 0 {
            return GateDecision::allow(None);
        }

        let now = Utc::now();
        let mut entries = self.entries.lock();

        if rand::random::<u32>() % EVICTION_ROLL == 0 {
            let cutoff = now - Duration::hours(STALE_ENTRY_HOURS);
            entries.retain(|_, reviewed_at| *reviewed_at >= cutoff);
        }

        let Some(&last) = entries.get(key) else {
            return GateDecision::allow(None);
        };

        let interval = Duration::minutes(interval_minutes);
        let elapsed = now - last;
        if elapsed < interval {
            let remaining = (interval - elapsed).num_milliseconds().max(0) as f64 / 1000.0;
            return GateDecision {
                allowed: false,
                seconds_remaining: remaining.ceil() as u64,
                last_reviewed_at: Some(last),
            };
        }

        GateDecision::allow(Some(last))
    }

    /// Mark `key` as reviewed now.
    pub fn record(&self, key: &GateKey) {
        self.entries.lock().insert(key.clone(), Utc::now());
    }

    /// Number of tracked PRs (diagnostics).
    pub fn tracked(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_case_insensitive() {
        let a = GateKey::new("Org", "Proj", "Repo", 7);
        let b = GateKey::new("org", "proj", "repo", 7);
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_key_is_allowed() {
        let gate = RateGate::new();
        let d = gate.check(&GateKey::new("o", "p", "r", 1), 5);
        assert!(d.allowed);
        assert_eq!(d.seconds_remaining, 0);
    }

    #[test]
    fn recent_record_blocks_within_interval() {
        let gate = RateGate::new();
        let key = GateKey::new("o", "p", "r", 1);
        gate.record(&key);

        let d = gate.check(&key, 5);
        assert!(!d.allowed);
        assert!(d.seconds_remaining > 0);
        assert!(d.seconds_remaining <= 5 * 60);
        assert!(d.last_reviewed_at.is_some());
    }

    #[test]
    fn zero_interval_disables_gate() {
        let gate = RateGate::new();
        let key = GateKey::new("o", "p", "r", 1);
        gate.record(&key);
        assert!(gate.check(&key, 0).allowed);
        assert!(gate.check(&key, -10).allowed);
    }

    #[test]
    fn different_prs_do_not_interfere() {
        let gate = RateGate::new();
        gate.record(&GateKey::new("o", "p", "r", 1));
        assert!(gate.check(&GateKey::new("o", "p", "r", 2), 5).allowed);
    }

    #[test]
    fn record_after_check_reinserts() {
        let gate = RateGate::new();
        let key = GateKey::new("o", "p", "r", 3);
        gate.record(&key);
        assert_eq!(gate.tracked(), 1);
        gate.record(&key);
        assert_eq!(gate.tracked(), 1);
        assert!(!gate.check(&key, 60).allowed);
    }

    #[test]
    fn concurrent_checks_do_not_panic() {
        use std::sync::Arc;

        let gate = Arc::new(RateGate::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let gate = Arc::clone(&gate);
            handles.push(std::thread::spawn(move || {
                let key = GateKey::new("o", "p", "r", i % 3);
                for _ in 0..500 {
                    gate.record(&key);
                    let _ = gate.check(&key, 5);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(gate.tracked() <= 3);
    }
}
