//! Eviction scoring strategies.
//!
//! A strategy assigns each candidate object a score; higher means more
//! evictable. Scoring also tallies the bytes of every positively-scored
//! object so that a scan can stop early once enough has been found:
//!
//! - [`OldestStrategy`]: pure recency, weighted by priority
//! - [`BySizeStrategy`]: pure size
//! - [`BigOldStrategy`]: priority × (age factor + capped size factor)
//!
//! Strategies are stateful, so planners keep a prototype and derive a fresh
//! instance per planning pass with [`SelectionStrategy::for_size`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache::object::{now_millis, CachedObject, DEFAULT_PRIORITY};

const HOUR_MS: f64 = 3_600_000.0;
const DAY_MS: f64 = 24.0 * HOUR_MS;

/// Default turnover age for [`BigOldStrategy`]: 2.5 hours.
pub const DEFAULT_TURNOVER_AGE_MS: f64 = 2.5 * HOUR_MS;
/// Default turnover size: 500 MB.
pub const DEFAULT_TURNOVER_SIZE: f64 = 0.5e9;
/// Default minimum age for [`OldestStrategy`]: 1 hour.
pub const DEFAULT_MIN_AGE_MS: i64 = 3_600_000;

/// Ranks cached objects by evictability.
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    /// Score `obj`, record the score on it and tally its size.
    fn score(&mut self, obj: &mut CachedObject) -> f64;

    /// Whether enough bytes have been scored to stop scanning.
    fn limit_reached(&self) -> bool;

    /// Clear accumulators so the strategy can score a new pass.
    fn reset(&mut self);

    /// Bytes of all positively-scored objects since the last reset.
    fn total_size(&self) -> u64;

    /// A fresh instance with the same tuning but a new scan limit.
    fn for_size(&self, limit: u64) -> Box<dyn SelectionStrategy>;
}

/// Running tally shared by the size-limited strategies.
#[derive(Debug, Clone, Default)]
struct SizeLimit {
    limit: u64,
    total: u64,
}

impl SizeLimit {
    fn new(limit: u64) -> Self {
        Self { limit, total: 0 }
    }

    fn tally(&mut self, obj: &CachedObject) {
        if obj.score > 0.0 {
            if let Some(sz) = obj.size.filter(|s| *s > 0) {
                self.total += sz;
            }
        }
    }

    fn reached(&self) -> bool {
        self.total > self.limit
    }

    fn reset(&mut self) {
        self.total = 0;
    }
}

fn age_of(obj: &CachedObject, now: i64) -> i64 {
    if obj.since > 0 {
        now - obj.since
    } else {
        0
    }
}

/// Scores by time since last access; objects younger than a minimum age
/// are never selected.
#[derive(Debug, Clone)]
pub struct OldestStrategy {
    tally: SizeLimit,
    now: i64,
    normal_priority: i64,
    min_age_ms: i64,
}

impl OldestStrategy {
    pub fn new(limit: u64) -> Self {
        Self::with_tuning(limit, DEFAULT_PRIORITY, DEFAULT_MIN_AGE_MS)
    }

    pub fn with_tuning(limit: u64, normal_priority: i64, min_age_ms: i64) -> Self {
        Self {
            tally: SizeLimit::new(limit),
            now: now_millis(),
            normal_priority: if normal_priority > 0 {
                normal_priority
            } else {
                DEFAULT_PRIORITY
            },
            min_age_ms,
        }
    }
}

impl SelectionStrategy for OldestStrategy {
    fn score(&mut self, obj: &mut CachedObject) -> f64 {
        let age = age_of(obj, self.now);
        obj.score = if age < self.min_age_ms {
            0.0
        } else {
            obj.priority as f64 * age as f64 / (DAY_MS * self.normal_priority as f64)
        };
        self.tally.tally(obj);
        obj.score
    }

    fn limit_reached(&self) -> bool {
        self.tally.reached()
    }

    fn reset(&mut self) {
        self.tally.reset();
        self.now = now_millis();
    }

    fn total_size(&self) -> u64 {
        self.tally.total
    }

    fn for_size(&self, limit: u64) -> Box<dyn SelectionStrategy> {
        Box::new(Self::with_tuning(
            limit,
            self.normal_priority,
            self.min_age_ms,
        ))
    }
}

/// Scores by size alone, normalized to a reference size.
#[derive(Debug, Clone)]
pub struct BySizeStrategy {
    tally: SizeLimit,
    norm: f64,
}

impl BySizeStrategy {
    pub fn new(limit: u64) -> Self {
        Self::with_norm(limit, DEFAULT_TURNOVER_SIZE)
    }

    pub fn with_norm(limit: u64, norm: f64) -> Self {
        Self {
            tally: SizeLimit::new(limit),
            norm: if norm > 0.0 { norm } else { 1.0 },
        }
    }
}

impl SelectionStrategy for BySizeStrategy {
    fn score(&mut self, obj: &mut CachedObject) -> f64 {
        obj.score = obj.size.map(|s| s as f64 / self.norm).unwrap_or(0.0);
        self.tally.tally(obj);
        obj.score
    }

    fn limit_reached(&self) -> bool {
        self.tally.reached()
    }

    fn reset(&mut self) {
        self.tally.reset();
    }

    fn total_size(&self) -> u64 {
        self.tally.total
    }

    fn for_size(&self, limit: u64) -> Box<dyn SelectionStrategy> {
        Box::new(Self::with_norm(limit, self.norm))
    }
}

/// Prefers objects that are both large and stale.
///
/// `score = priority × (age_factor + size_factor)` where the age factor is
/// zero until the turnover age and then grows by one per hour, and the size
/// factor is `min(1, size / turnover_size)`.
#[derive(Debug, Clone)]
pub struct BigOldStrategy {
    tally: SizeLimit,
    now: i64,
    turnover_age_ms: f64,
    turnover_size: f64,
}

impl BigOldStrategy {
    pub fn new(limit: u64) -> Self {
        Self::with_turnover(limit, DEFAULT_TURNOVER_AGE_MS, DEFAULT_TURNOVER_SIZE)
    }

    /// Non-positive turnover values fall back to the defaults.
    pub fn with_turnover(limit: u64, age_ms: f64, size: f64) -> Self {
        Self {
            tally: SizeLimit::new(limit),
            now: now_millis(),
            turnover_age_ms: if age_ms > 0.0 {
                age_ms
            } else {
                DEFAULT_TURNOVER_AGE_MS
            },
            turnover_size: if size > 0.0 {
                size
            } else {
                DEFAULT_TURNOVER_SIZE
            },
        }
    }

    pub fn turnover_age_ms(&self) -> f64 {
        self.turnover_age_ms
    }

    pub fn turnover_size(&self) -> f64 {
        self.turnover_size
    }

    fn age_factor(&self, age_ms: i64) -> f64 {
        let over = age_ms as f64 - self.turnover_age_ms;
        if over <= 0.0 {
            0.0
        } else {
            over / HOUR_MS
        }
    }

    fn size_factor(&self, size: u64) -> f64 {
        (size as f64 / self.turnover_size).min(1.0)
    }
}

impl SelectionStrategy for BigOldStrategy {
    fn score(&mut self, obj: &mut CachedObject) -> f64 {
        let fage = self.age_factor(age_of(obj, self.now));
        let fsz = self.size_factor(obj.size_bytes());
        obj.score = (obj.priority as f64 * (fage + fsz)).max(0.0);
        self.tally.tally(obj);
        obj.score
    }

    fn limit_reached(&self) -> bool {
        self.tally.reached()
    }

    fn reset(&mut self) {
        self.tally.reset();
        self.now = now_millis();
    }

    fn total_size(&self) -> u64 {
        self.tally.total
    }

    fn for_size(&self, limit: u64) -> Box<dyn SelectionStrategy> {
        Box::new(Self::with_turnover(
            limit,
            self.turnover_age_ms,
            self.turnover_size,
        ))
    }
}

/// Strategy names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    BigOld,
    Oldest,
    BySize,
}

/// Tuning shared by all strategy kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyTuning {
    pub turnover_age_ms: f64,
    pub turnover_size: f64,
    pub min_age_ms: i64,
    pub normal_priority: i64,
}

impl Default for StrategyTuning {
    fn default() -> Self {
        Self {
            turnover_age_ms: DEFAULT_TURNOVER_AGE_MS,
            turnover_size: DEFAULT_TURNOVER_SIZE,
            min_age_ms: DEFAULT_MIN_AGE_MS,
            normal_priority: DEFAULT_PRIORITY,
        }
    }
}

impl StrategyKind {
    /// Build a prototype with an unbounded scan limit.
    pub fn build(self, tuning: &StrategyTuning) -> Box<dyn SelectionStrategy> {
        match self {
            StrategyKind::BigOld => Box::new(BigOldStrategy::with_turnover(
                u64::MAX,
                tuning.turnover_age_ms,
                tuning.turnover_size,
            )),
            StrategyKind::Oldest => Box::new(OldestStrategy::with_tuning(
                u64::MAX,
                tuning.normal_priority,
                tuning.min_age_ms,
            )),
            StrategyKind::BySize => Box::new(BySizeStrategy::with_norm(
                u64::MAX,
                tuning.turnover_size,
            )),
        }
    }
}
