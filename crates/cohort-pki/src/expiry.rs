//! Expiry policies — when does a cached certificate need refreshing?
//!
//! A policy is consulted serially (never concurrently) by a
//! `CachedSource` holding its lock. A `None` leaf means "nothing cached
//! yet"; the cached source forces the first refresh itself, so every
//! policy answers `false` for it.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::verify::LeafInfo;

pub trait Expiry: Send {
    fn expired(&mut self, leaf: Option<&LeafInfo>) -> bool;
}

/// Fires once every `interval`, regardless of certificate state, and
/// resets its own deadline each time it fires.
pub struct After {
    interval: Duration,
    deadline: Option<DateTime<Utc>>,
}

impl After {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }
}

impl Expiry for After {
    fn expired(&mut self, leaf: Option<&LeafInfo>) -> bool {
        if leaf.is_none() {
            return false;
        }
        let now = Utc::now();
        match self.deadline {
            None => {
                self.deadline = Some(now + self.interval);
                false
            }
            Some(deadline) if now >= deadline => {
                self.deadline = Some(now + self.interval);
                true
            }
            Some(_) => false,
        }
    }
}

/// Fires once the certificate is within `margin` of its notAfter.
pub struct BeforeInvalid {
    margin: Duration,
}

impl BeforeInvalid {
    pub fn new(margin: Duration) -> Self {
        Self { margin }
    }
}

impl Expiry for BeforeInvalid {
    fn expired(&mut self, leaf: Option<&LeafInfo>) -> bool {
        leaf.map(|l| Utc::now() >= l.not_after - self.margin)
            .unwrap_or(false)
    }
}

/// Fires once the certificate has been valid for `age`.
pub struct AfterValid {
    age: Duration,
}

impl AfterValid {
    pub fn new(age: Duration) -> Self {
        Self { age }
    }
}

impl Expiry for AfterValid {
    fn expired(&mut self, leaf: Option<&LeafInfo>) -> bool {
        leaf.map(|l| Utc::now() >= l.not_before + self.age)
            .unwrap_or(false)
    }
}

/// Fires once the elapsed fraction of the validity window reaches
/// `fraction`. `AfterProgress::half_life()` (0.5) is the default
/// rotation policy for self-minted certificates — it leaves half the
/// validity window for retries before the certificate actually expires.
pub struct AfterProgress {
    fraction: f64,
}

impl AfterProgress {
    pub fn new(fraction: f64) -> Self {
        Self { fraction }
    }

    pub fn half_life() -> Self {
        Self::new(0.5)
    }
}

impl Expiry for AfterProgress {
    fn expired(&mut self, leaf: Option<&LeafInfo>) -> bool {
        let Some(leaf) = leaf else { return false };
        let total = (leaf.not_after - leaf.not_before).num_milliseconds();
        if total <= 0 {
            return true;
        }
        let elapsed = (Utc::now() - leaf.not_before).num_milliseconds();
        elapsed as f64 / total as f64 >= self.fraction
    }
}

/// Fires exactly once after its paired `ManualTrigger` is invoked.
/// Used for operator- or test-forced rotation.
pub struct Manually {
    triggered: Arc<AtomicBool>,
}

/// Handle used to request one refresh from a `Manually` policy.
#[derive(Clone)]
pub struct ManualTrigger {
    triggered: Arc<AtomicBool>,
}

impl Manually {
    pub fn new() -> (Self, ManualTrigger) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            Self {
                triggered: flag.clone(),
            },
            ManualTrigger { triggered: flag },
        )
    }
}

impl ManualTrigger {
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }
}

impl Expiry for Manually {
    fn expired(&mut self, leaf: Option<&LeafInfo>) -> bool {
        if leaf.is_none() {
            return false;
        }
        self.triggered.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A leaf with its validity window positioned relative to now.
    fn leaf_with_window(started_ago: Duration, total: Duration) -> LeafInfo {
        let not_before = Utc::now() - started_ago;
        LeafInfo {
            subject_cn: Some("test".into()),
            dns_sans: vec![],
            ip_sans: vec![],
            uri_sans: vec![],
            spki_der: vec![],
            not_before,
            not_after: not_before + total,
        }
    }

    #[test]
    fn all_policies_false_for_no_leaf() {
        assert!(!After::new(Duration::seconds(0)).expired(None));
        assert!(!BeforeInvalid::new(Duration::days(365)).expired(None));
        assert!(!AfterValid::new(Duration::seconds(0)).expired(None));
        assert!(!AfterProgress::new(0.0).expired(None));
        let (mut manually, trigger) = Manually::new();
        trigger.trigger();
        assert!(!manually.expired(None));
    }

    #[test]
    fn after_fires_on_elapsed_interval_and_resets() {
        let leaf = leaf_with_window(Duration::seconds(10), Duration::seconds(100));
        let mut policy = After::new(Duration::milliseconds(0));
        // First call arms the deadline.
        assert!(!policy.expired(Some(&leaf)));
        // Zero interval: every later call fires.
        assert!(policy.expired(Some(&leaf)));
        assert!(policy.expired(Some(&leaf)));

        let mut slow = After::new(Duration::hours(1));
        assert!(!slow.expired(Some(&leaf)));
        assert!(!slow.expired(Some(&leaf)));
    }

    #[test]
    fn before_invalid_fires_within_margin() {
        // 100s window, 10s elapsed: 90s remain.
        let leaf = leaf_with_window(Duration::seconds(10), Duration::seconds(100));
        assert!(!BeforeInvalid::new(Duration::seconds(30)).expired(Some(&leaf)));
        assert!(BeforeInvalid::new(Duration::seconds(91)).expired(Some(&leaf)));
    }

    #[test]
    fn after_valid_fires_past_age() {
        let leaf = leaf_with_window(Duration::seconds(60), Duration::seconds(600));
        assert!(AfterValid::new(Duration::seconds(30)).expired(Some(&leaf)));
        assert!(!AfterValid::new(Duration::seconds(120)).expired(Some(&leaf)));
    }

    #[test]
    fn after_progress_half_life_boundary() {
        // NotBefore=T, NotAfter=T+100s.
        let mut policy = AfterProgress::half_life();

        // At T+49s: 49% elapsed — not yet.
        let at_49 = leaf_with_window(Duration::seconds(49), Duration::seconds(100));
        assert!(!policy.expired(Some(&at_49)));

        // At T+50s: exactly half — fires.
        let at_50 = leaf_with_window(Duration::seconds(50), Duration::seconds(100));
        assert!(policy.expired(Some(&at_50)));

        // After a refresh the new cert starts its own window; at 1s in
        // it is nowhere near half-life.
        let fresh = leaf_with_window(Duration::seconds(1), Duration::seconds(100));
        assert!(!policy.expired(Some(&fresh)));
    }

    #[test]
    fn after_progress_degenerate_window_fires() {
        let leaf = leaf_with_window(Duration::seconds(0), Duration::seconds(0));
        assert!(AfterProgress::half_life().expired(Some(&leaf)));
    }

    #[test]
    fn manually_fires_exactly_once_per_trigger() {
        let leaf = leaf_with_window(Duration::seconds(1), Duration::seconds(100));
        let (mut policy, trigger) = Manually::new();

        assert!(!policy.expired(Some(&leaf)));
        trigger.trigger();
        assert!(policy.expired(Some(&leaf)));
        assert!(!policy.expired(Some(&leaf)));

        trigger.trigger();
        assert!(policy.expired(Some(&leaf)));
    }
}
