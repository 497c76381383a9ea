//! Sleep-cycle and account-rotation control.
//!
//! Evaluated at the start of every interval batch. Detects the
//! "posted ≡ 0 (mod limit)" trigger, opens a randomized sleep window,
//! and when rotation is enabled swaps part of the principal pool with
//! the secondary reserve. Waking closes the window, optionally redraws
//! the limit, and restores the principal pool.

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::EngineError;
use crate::storage::schedules::{
    self, AccountPool, ActivePool, RotationUpdate, Schedule,
};
use crate::storage::DbPool;

/// Share of the principal pool swapped per rotation.
const ROTATION_SHARE: f64 = 0.3;

/// What the driver should do with this batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPlan {
    /// Dispatch, then schedule the follow-up `interval_ms` after batch start.
    Proceed {
        /// Effective interval for the recursive-delay follow-up.
        interval_ms: i64,
    },
    /// Skip dispatch; schedule the follow-up after `delay_ms` (sleep window).
    Sleep {
        /// Remaining (or fresh) sleep window in milliseconds.
        delay_ms: i64,
    },
}

/// Evaluate sleep state and compute the effective interval for one batch.
///
/// Mutates the schedule row (sleep fields, limit redraw, interval redraw,
/// rotation pools) and returns the plan. The caller re-reads the schedule
/// afterwards when it needs the updated pools.
pub async fn evaluate(pool: &DbPool, schedule: &Schedule) -> Result<BatchPlan, EngineError> {
    let now = Utc::now();

    // Still inside an open sleep window (e.g. replay after restart):
    // keep waiting out the remainder.
    if schedule.sleeping_at(now) {
        let start = schedule
            .sleep_delay_start_time
            .as_deref()
            .and_then(crate::storage::parse_ts)
            .unwrap_or(now);
        let wake_at = start + chrono::Duration::minutes(schedule.sleep_delay_minutes);
        let remaining_ms = (wake_at - now).num_milliseconds().max(1_000);
        tracing::debug!(
            schedule_id = schedule.id,
            remaining_ms,
            "Sleep window still open, deferring batch"
        );
        return Ok(BatchPlan::Sleep {
            delay_ms: remaining_ms,
        });
    }

    // A closed window left behind its fields: wake up.
    if schedule.sleep_delay_minutes > 0 && schedule.sleep_delay_start_time.is_some() {
        wake(pool, schedule).await?;
    }

    // Sleep trigger: every `limit_value` successful posts, exactly once
    // per posted-count value (the guard survives crashes mid-trigger).
    let posted = schedule.posted_comments;
    let limit = schedule.limit_value;
    if limit > 0 && posted > 0 && posted % limit == 0 && schedule.last_sleep_trigger_count != posted
    {
        let minutes = draw_sleep_minutes(schedule);
        schedules::enter_sleep(pool, schedule.id, minutes, posted).await?;
        tracing::info!(
            schedule_id = schedule.id,
            posted,
            sleep_minutes = minutes,
            "Sleep cycle triggered"
        );

        if schedule.rotation_enabled {
            rotate(pool, schedule).await?;
        }

        return Ok(BatchPlan::Sleep {
            delay_ms: minutes * 60_000,
        });
    }

    Ok(BatchPlan::Proceed {
        interval_ms: effective_interval_ms(pool, schedule).await?,
    })
}

/// Close the sleep window: clear the fields, redraw a random limit, and
/// rotate back to the principal pool.
async fn wake(pool: &DbPool, schedule: &Schedule) -> Result<(), EngineError> {
    let new_limit = if schedule.limit_is_random {
        match (schedule.limit_min, schedule.limit_max) {
            (Some(min), Some(max)) if min > 0 && min <= max => {
                Some(rand::thread_rng().gen_range(min..=max))
            }
            _ => None,
        }
    } else {
        None
    };

    schedules::clear_sleep(pool, schedule.id, new_limit).await?;
    tracing::info!(
        schedule_id = schedule.id,
        new_limit = ?new_limit,
        "Sleep window ended"
    );

    if schedule.rotation_enabled && schedule.currently_active == ActivePool::Secondary {
        rotate_back(pool, schedule).await?;
    }
    Ok(())
}

/// Draw the sleep window length from `[min_delay, max_delay]` minutes.
fn draw_sleep_minutes(schedule: &Schedule) -> i64 {
    let min = schedule.min_delay_minutes.max(1);
    let max = schedule.max_delay_minutes.max(min);
    if min == max {
        min
    } else {
        rand::thread_rng().gen_range(min..=max)
    }
}

/// Swap `k = min(⌈0.3·|principal|⌉, |secondary|)` accounts between the
/// pools, or restore the principal pool when secondary is live.
async fn rotate(pool: &DbPool, schedule: &Schedule) -> Result<(), EngineError> {
    match schedule.currently_active {
        ActivePool::Principal => rotate_out(pool, schedule).await,
        ActivePool::Secondary => rotate_back(pool, schedule).await,
    }
}

/// Principal → mixed set: rotate `k` principals out and `k` secondaries
/// in, preferring accounts that did not move in the previous cycle.
async fn rotate_out(pool: &DbPool, schedule: &Schedule) -> Result<(), EngineError> {
    let principal = schedules::get_pool(pool, schedule.id, AccountPool::Principal).await?;
    let secondary = schedules::get_pool(pool, schedule.id, AccountPool::Secondary).await?;
    if principal.is_empty() || secondary.is_empty() {
        tracing::warn!(schedule_id = schedule.id, "Rotation enabled but a pool is empty");
        return Ok(());
    }

    let prev_out = schedules::get_pool(pool, schedule.id, AccountPool::RotatedPrincipal).await?;
    let prev_in = schedules::get_pool(pool, schedule.id, AccountPool::RotatedSecondary).await?;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let k = ((principal.len() as f64 * ROTATION_SHARE).ceil() as usize).min(secondary.len());

    let out = pick_preferring_fresh(&principal, &prev_out, k);
    let inn = pick_preferring_fresh(&secondary, &prev_in, k);

    let mut selected: Vec<i64> = principal
        .iter()
        .copied()
        .filter(|id| !out.contains(id))
        .collect();
    selected.extend(inn.iter().copied());

    schedules::apply_rotation(
        pool,
        schedule.id,
        &RotationUpdate {
            selected,
            rotated_principal: out.clone(),
            rotated_secondary: inn.clone(),
            currently_active: ActivePool::Secondary,
        },
    )
    .await?;

    tracing::info!(
        schedule_id = schedule.id,
        rotated_out = out.len(),
        rotated_in = inn.len(),
        "Rotated to secondary pool"
    );
    Ok(())
}

/// Mixed set → principal: restore the full principal pool. The rotated
/// sets are kept so the next swap prefers different accounts.
async fn rotate_back(pool: &DbPool, schedule: &Schedule) -> Result<(), EngineError> {
    let principal = schedules::get_pool(pool, schedule.id, AccountPool::Principal).await?;
    let prev_out = schedules::get_pool(pool, schedule.id, AccountPool::RotatedPrincipal).await?;
    let prev_in = schedules::get_pool(pool, schedule.id, AccountPool::RotatedSecondary).await?;

    schedules::apply_rotation(
        pool,
        schedule.id,
        &RotationUpdate {
            selected: principal,
            rotated_principal: prev_out,
            rotated_secondary: prev_in,
            currently_active: ActivePool::Principal,
        },
    )
    .await?;

    tracing::info!(schedule_id = schedule.id, "Rotated back to principal pool");
    Ok(())
}

/// Choose `k` random entries, preferring ones not in `previous`.
fn pick_preferring_fresh(candidates: &[i64], previous: &[i64], k: usize) -> Vec<i64> {
    let mut fresh: Vec<i64> = candidates
        .iter()
        .copied()
        .filter(|id| !previous.contains(id))
        .collect();
    let mut stale: Vec<i64> = candidates
        .iter()
        .copied()
        .filter(|id| previous.contains(id))
        .collect();

    let mut rng = rand::thread_rng();
    fresh.shuffle(&mut rng);
    stale.shuffle(&mut rng);
    fresh.extend(stale);
    fresh.truncate(k);
    fresh
}

/// The non-trigger path: redraw a random interval when configured, and
/// convert to milliseconds.
async fn effective_interval_ms(pool: &DbPool, schedule: &Schedule) -> Result<i64, EngineError> {
    let value = if schedule.interval_is_random {
        match (schedule.interval_min, schedule.interval_max) {
            (Some(min), Some(max)) if min > 0 && min <= max => {
                let drawn = if min == max {
                    min
                } else {
                    rand::thread_rng().gen_range(min..=max)
                };
                if drawn != schedule.interval_value {
                    schedules::set_interval_value(pool, schedule.id, drawn).await?;
                }
                drawn
            }
            _ => schedule.interval_value,
        }
    } else {
        schedule.interval_value
    };

    Ok(value.max(1) * schedule.interval_unit.millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schedules::{
        AccountSelection, IntervalUnit, NewSchedule, ScheduleType, TargetVideo,
    };
    use crate::storage::{accounts, init_test_db, users};

    async fn seed_schedule(pool: &DbPool) -> i64 {
        let uid = users::insert_user(pool, "owner@example.com")
            .await
            .expect("user");
        schedules::insert_schedule(
            pool,
            &NewSchedule {
                user_id: uid,
                name: "s".to_string(),
                schedule_type: ScheduleType::Interval,
                start_date: None,
                end_date: None,
                cron_expression: None,
                interval_value: 2,
                interval_unit: IntervalUnit::Minutes,
                comment_templates: vec!["t".to_string()],
                target_videos: vec![TargetVideo {
                    video_id: "v".to_string(),
                    title: None,
                }],
                account_selection: AccountSelection::Random,
            },
        )
        .await
        .expect("schedule")
    }

    async fn seed_accounts(pool: &DbPool, user_id: i64, n: usize) -> Vec<i64> {
        let mut ids = Vec::new();
        for _ in 0..n {
            ids.push(
                accounts::insert_account(
                    pool,
                    &accounts::NewAccount {
                        user_id,
                        proxy_id: None,
                        api_profile_id: None,
                        refresh_token: "rt",
                        channel_id: None,
                        channel_title: None,
                    },
                )
                .await
                .expect("account"),
            );
        }
        ids
    }

    #[tokio::test]
    async fn no_trigger_returns_interval() {
        let pool = init_test_db().await.expect("init");
        let sid = seed_schedule(&pool).await;
        let schedule = schedules::require_schedule(&pool, sid).await.expect("get");

        let plan = evaluate(&pool, &schedule).await.expect("evaluate");
        assert_eq!(plan, BatchPlan::Proceed { interval_ms: 120_000 });
    }

    #[tokio::test]
    async fn trigger_enters_sleep_once_per_count() {
        let pool = init_test_db().await.expect("init");
        let sid = seed_schedule(&pool).await;
        sqlx::query(
            "UPDATE schedules SET limit_value = 5, posted_comments = 5, \
             min_delay_minutes = 3, max_delay_minutes = 7 WHERE id = ?",
        )
        .bind(sid)
        .execute(&pool)
        .await
        .expect("seed");

        let schedule = schedules::require_schedule(&pool, sid).await.expect("get");
        let plan = evaluate(&pool, &schedule).await.expect("evaluate");
        match plan {
            BatchPlan::Sleep { delay_ms } => {
                assert!((3 * 60_000..=7 * 60_000).contains(&delay_ms));
            }
            other => panic!("expected sleep, got {other:?}"),
        }

        let slept = schedules::require_schedule(&pool, sid).await.expect("get");
        assert_eq!(slept.last_sleep_trigger_count, 5);
        assert!(slept.sleep_delay_minutes >= 3);

        // Same posted count after waking: the guard suppresses a re-trigger.
        schedules::clear_sleep(&pool, sid, None).await.expect("wake");
        let woken = schedules::require_schedule(&pool, sid).await.expect("get");
        let plan = evaluate(&pool, &woken).await.expect("evaluate");
        assert!(matches!(plan, BatchPlan::Proceed { .. }));
    }

    #[tokio::test]
    async fn open_window_defers_without_side_effects() {
        let pool = init_test_db().await.expect("init");
        let sid = seed_schedule(&pool).await;
        schedules::enter_sleep(&pool, sid, 10, 5).await.expect("sleep");

        let schedule = schedules::require_schedule(&pool, sid).await.expect("get");
        let plan = evaluate(&pool, &schedule).await.expect("evaluate");
        match plan {
            BatchPlan::Sleep { delay_ms } => {
                assert!(delay_ms <= 10 * 60_000);
                assert!(delay_ms > 9 * 60_000);
            }
            other => panic!("expected sleep, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_window_wakes_and_redraws_limit() {
        let pool = init_test_db().await.expect("init");
        let sid = seed_schedule(&pool).await;
        // A window that started an hour ago and lasted 5 minutes.
        sqlx::query(
            "UPDATE schedules SET sleep_delay_minutes = 5, \
             sleep_delay_start_time = ?, limit_is_random = 1, limit_min = 4, limit_max = 9 \
             WHERE id = ?",
        )
        .bind(crate::storage::format_ts(
            Utc::now() - chrono::Duration::hours(1),
        ))
        .bind(sid)
        .execute(&pool)
        .await
        .expect("seed");

        let schedule = schedules::require_schedule(&pool, sid).await.expect("get");
        let plan = evaluate(&pool, &schedule).await.expect("evaluate");
        assert!(matches!(plan, BatchPlan::Proceed { .. }));

        let woken = schedules::require_schedule(&pool, sid).await.expect("get");
        assert_eq!(woken.sleep_delay_minutes, 0);
        assert!(woken.sleep_delay_start_time.is_none());
        assert!((4..=9).contains(&woken.limit_value));
    }

    #[tokio::test]
    async fn random_interval_with_equal_bounds_is_exact() {
        let pool = init_test_db().await.expect("init");
        let sid = seed_schedule(&pool).await;
        sqlx::query(
            "UPDATE schedules SET interval_is_random = 1, interval_min = 4, interval_max = 4 \
             WHERE id = ?",
        )
        .bind(sid)
        .execute(&pool)
        .await
        .expect("seed");

        let schedule = schedules::require_schedule(&pool, sid).await.expect("get");
        let plan = evaluate(&pool, &schedule).await.expect("evaluate");
        assert_eq!(plan, BatchPlan::Proceed { interval_ms: 240_000 });

        let updated = schedules::require_schedule(&pool, sid).await.expect("get");
        assert_eq!(updated.interval_value, 4);
    }

    #[tokio::test]
    async fn rotation_swaps_k_accounts() {
        let pool = init_test_db().await.expect("init");
        let sid = seed_schedule(&pool).await;
        let schedule = schedules::require_schedule(&pool, sid).await.expect("get");
        let uid = schedule.user_id;

        let principal = seed_accounts(&pool, uid, 6).await;
        let secondary = seed_accounts(&pool, uid, 3).await;
        schedules::replace_pool(&pool, sid, AccountPool::Principal, &principal)
            .await
            .expect("principal");
        schedules::replace_pool(&pool, sid, AccountPool::Secondary, &secondary)
            .await
            .expect("secondary");
        schedules::replace_pool(&pool, sid, AccountPool::Selected, &principal)
            .await
            .expect("selected");

        sqlx::query(
            "UPDATE schedules SET rotation_enabled = 1, limit_value = 5, posted_comments = 5 \
             WHERE id = ?",
        )
        .bind(sid)
        .execute(&pool)
        .await
        .expect("seed");

        let schedule = schedules::require_schedule(&pool, sid).await.expect("get");
        let plan = evaluate(&pool, &schedule).await.expect("evaluate");
        assert!(matches!(plan, BatchPlan::Sleep { .. }));

        // k = min(ceil(0.3 * 6), 3) = 2.
        let rotated = schedules::require_schedule(&pool, sid).await.expect("get");
        assert_eq!(rotated.currently_active, ActivePool::Secondary);

        let selected = schedules::get_pool(&pool, sid, AccountPool::Selected)
            .await
            .expect("selected");
        assert_eq!(selected.len(), 6);
        let out = schedules::get_pool(&pool, sid, AccountPool::RotatedPrincipal)
            .await
            .expect("out");
        let inn = schedules::get_pool(&pool, sid, AccountPool::RotatedSecondary)
            .await
            .expect("in");
        assert_eq!(out.len(), 2);
        assert_eq!(inn.len(), 2);
        for id in &out {
            assert!(principal.contains(id));
            assert!(!selected.contains(id));
        }
        for id in &inn {
            assert!(secondary.contains(id));
            assert!(selected.contains(id));
        }
    }

    #[tokio::test]
    async fn wake_rotates_back_to_principal() {
        let pool = init_test_db().await.expect("init");
        let sid = seed_schedule(&pool).await;
        let schedule = schedules::require_schedule(&pool, sid).await.expect("get");
        let uid = schedule.user_id;

        let principal = seed_accounts(&pool, uid, 4).await;
        let secondary = seed_accounts(&pool, uid, 2).await;
        schedules::replace_pool(&pool, sid, AccountPool::Principal, &principal)
            .await
            .expect("principal");
        schedules::replace_pool(&pool, sid, AccountPool::Secondary, &secondary)
            .await
            .expect("secondary");

        // Simulate: currently on the mixed/secondary set with an expired window.
        sqlx::query(
            "UPDATE schedules SET rotation_enabled = 1, currently_active = 'secondary', \
             sleep_delay_minutes = 5, sleep_delay_start_time = ? WHERE id = ?",
        )
        .bind(crate::storage::format_ts(
            Utc::now() - chrono::Duration::hours(1),
        ))
        .bind(sid)
        .execute(&pool)
        .await
        .expect("seed");

        let schedule = schedules::require_schedule(&pool, sid).await.expect("get");
        evaluate(&pool, &schedule).await.expect("evaluate");

        let woken = schedules::require_schedule(&pool, sid).await.expect("get");
        assert_eq!(woken.currently_active, ActivePool::Principal);
        let selected = schedules::get_pool(&pool, sid, AccountPool::Selected)
            .await
            .expect("selected");
        assert_eq!(selected, principal);
    }

    #[test]
    fn pick_preferring_fresh_avoids_previous() {
        let candidates = vec![1, 2, 3, 4];
        let previous = vec![1, 2];
        for _ in 0..20 {
            let picked = pick_preferring_fresh(&candidates, &previous, 2);
            assert_eq!(picked.len(), 2);
            assert!(picked.contains(&3));
            assert!(picked.contains(&4));
        }
    }

    #[test]
    fn pick_preferring_fresh_falls_back_to_previous() {
        let candidates = vec![1, 2];
        let previous = vec![1, 2];
        let picked = pick_preferring_fresh(&candidates, &previous, 2);
        assert_eq!(picked.len(), 2);
    }
}
