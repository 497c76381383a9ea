//! Account selection for dispatch.
//!
//! Picks the next account per dispatch, never repeating the immediately
//! previous account (globally, and per target video via the cache marker),
//! weighted toward least-recently-used accounts. Constraints relax in
//! order when they would eliminate every candidate.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;

use crate::cache::{last_account_key, Cache};

/// Weight ceiling: an unused account weighs 20, every recent use
/// subtracts one, floor 1.
const WEIGHT_CEILING: u32 = 20;

/// In-process per-schedule account usage counter.
///
/// Owned by the selector; seeded directly in tests. Compaction keeps the
/// top entries per schedule and halves the counts so old usage decays.
pub struct UsageTracker {
    counts: Mutex<HashMap<i64, HashMap<i64, u32>>>,
}

impl UsageTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Record a dispatch of `account_id` for `schedule_id`.
    pub fn record(&self, schedule_id: i64, account_id: i64) {
        let mut counts = self.counts.lock().expect("tracker lock poisoned");
        *counts
            .entry(schedule_id)
            .or_default()
            .entry(account_id)
            .or_insert(0) += 1;
    }

    /// Recent-use count for an account within a schedule.
    pub fn count(&self, schedule_id: i64, account_id: i64) -> u32 {
        let counts = self.counts.lock().expect("tracker lock poisoned");
        counts
            .get(&schedule_id)
            .and_then(|by_account| by_account.get(&account_id))
            .copied()
            .unwrap_or(0)
    }

    /// Seed a count (tests).
    pub fn seed(&self, schedule_id: i64, account_id: i64, count: u32) {
        let mut counts = self.counts.lock().expect("tracker lock poisoned");
        counts
            .entry(schedule_id)
            .or_default()
            .insert(account_id, count);
    }

    /// Keep the `keep_top` most-used entries per schedule and halve the
    /// surviving counts.
    pub fn compact(&self, keep_top: usize) {
        let mut counts = self.counts.lock().expect("tracker lock poisoned");
        for by_account in counts.values_mut() {
            if by_account.len() > keep_top {
                let mut entries: Vec<(i64, u32)> =
                    by_account.iter().map(|(k, v)| (*k, *v)).collect();
                entries.sort_by(|a, b| b.1.cmp(&a.1));
                entries.truncate(keep_top);
                *by_account = entries.into_iter().collect();
            }
            for count in by_account.values_mut() {
                *count /= 2;
            }
        }
        counts.retain(|_, by_account| {
            by_account.retain(|_, count| *count > 0);
            !by_account.is_empty()
        });
    }

    /// Drop all counters for a schedule.
    pub fn forget(&self, schedule_id: i64) {
        let mut counts = self.counts.lock().expect("tracker lock poisoned");
        counts.remove(&schedule_id);
    }
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the next account for a dispatch.
///
/// `candidates` are the already-eligible (active, pool-filtered) account
/// ids. Returns `None` only when `candidates` is empty.
pub async fn select_account(
    cache: &dyn Cache,
    tracker: &UsageTracker,
    schedule_id: i64,
    video_id: &str,
    candidates: &[i64],
    last_used_account_id: Option<i64>,
) -> Option<i64> {
    if candidates.is_empty() {
        return None;
    }

    // Rule 1: with more than one candidate, never repeat the previous account.
    let after_global: Vec<i64> = if candidates.len() > 1 {
        candidates
            .iter()
            .copied()
            .filter(|id| Some(*id) != last_used_account_id)
            .collect()
    } else {
        candidates.to_vec()
    };
    let after_global = if after_global.is_empty() {
        tracing::warn!(
            schedule_id,
            "All candidates excluded by previous-account rule, relaxing"
        );
        candidates.to_vec()
    } else {
        after_global
    };

    // Rule 2: also avoid the last account used on this specific video.
    let video_last: Option<i64> = cache
        .get(&last_account_key(schedule_id, video_id))
        .await
        .and_then(|v| v.parse().ok());

    let after_video: Vec<i64> = match video_last {
        Some(last) => {
            let filtered: Vec<i64> = after_global
                .iter()
                .copied()
                .filter(|id| *id != last)
                .collect();
            if filtered.is_empty() {
                tracing::warn!(
                    schedule_id,
                    video_id,
                    "All candidates excluded by per-video rule, relaxing"
                );
                after_global
            } else {
                filtered
            }
        }
        None => after_global,
    };

    Some(weighted_pick(tracker, schedule_id, &after_video))
}

/// Weighted random pick: weight = max(1, 20 − recent uses).
fn weighted_pick(tracker: &UsageTracker, schedule_id: i64, pool: &[i64]) -> i64 {
    let weights: Vec<u32> = pool
        .iter()
        .map(|id| WEIGHT_CEILING.saturating_sub(tracker.count(schedule_id, *id)).max(1))
        .collect();
    let total: u32 = weights.iter().sum();

    let mut roll = rand::thread_rng().gen_range(0..total);
    for (id, weight) in pool.iter().zip(weights) {
        if roll < weight {
            return *id;
        }
        roll -= weight;
    }
    pool[pool.len() - 1]
}

/// Bookkeeping after a dispatch: bump the usage counter and remember the
/// account on the video marker (24h TTL).
pub async fn record_dispatch(
    cache: &dyn Cache,
    tracker: &UsageTracker,
    schedule_id: i64,
    video_id: &str,
    account_id: i64,
) {
    tracker.record(schedule_id, account_id);
    cache
        .put(
            &last_account_key(schedule_id, video_id),
            &account_id.to_string(),
            std::time::Duration::from_secs(24 * 3600),
        )
        .await;
}
