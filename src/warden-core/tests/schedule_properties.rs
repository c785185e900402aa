//! Property-based tests for schedule resolution and connection
//! escalation.
//!
//! These tests verify that schedule activation agrees with a numeric
//! oracle across arbitrary instants, and that the connection state
//! machine escalates as a pure function of the failure count.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use warden_core::{
    keys, ConfigStore, ConnectionMonitor, ConnectionState, MemoryStore, Policy, Schedule,
};

/// Strategy for an arbitrary wall-clock instant.
fn instant_strategy() -> impl Strategy<Value = (i32, u32, u32, u32, u32)> {
    (2024i32..=2030, 1u32..=12, 1u32..=28, 0u32..=23, 0u32..=59)
}

/// Strategy for a "HH:MM" bound as an (hour, minute) pair.
fn bound_strategy() -> impl Strategy<Value = (u32, u32)> {
    (0u32..=23, 0u32..=59)
}

/// Strategy for a non-empty day-of-week set (0 = Sunday).
fn days_strategy() -> impl Strategy<Value = BTreeSet<u8>> {
    prop::collection::btree_set(0u8..=6, 1..=7)
}

fn hhmm((h, m): (u32, u32)) -> String {
    format!("{h:02}:{m:02}")
}

/// A monitor with stored credentials, initialized into CONNECTING.
fn paired_monitor() -> ConnectionMonitor {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    store.set(keys::AUTH_TOKEN, json!("token")).unwrap();
    store.set(keys::AGENT_ID, json!("agent-1")).unwrap();
    let monitor = ConnectionMonitor::new(store);
    monitor.initialize();
    monitor
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    // ========================================================================
    // Schedule Resolution Properties
    // ========================================================================

    /// A policy without a schedule is active at every instant.
    #[test]
    fn no_schedule_always_active((y, mo, d, h, mi) in instant_strategy()) {
        let now = Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap();
        prop_assert!(Policy::new("p", "proc").is_active_at(&now));
    }

    /// A days-only schedule is active exactly on its listed weekdays.
    #[test]
    fn days_schedule_matches_weekday(
        (y, mo, d, h, mi) in instant_strategy(),
        days in days_strategy(),
    ) {
        let now = Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap();
        let policy = Policy::new("p", "proc").with_schedule(Schedule {
            start_time: None,
            end_time: None,
            days: Some(days.clone()),
        });

        let weekday = now.weekday().num_days_from_sunday() as u8;
        prop_assert_eq!(policy.is_active_at(&now), days.contains(&weekday));
    }

    /// An ordered time window matches exactly the inclusive numeric
    /// range, checked against a minute-arithmetic oracle.
    #[test]
    fn window_schedule_matches_numeric_range(
        (y, mo, d, h, mi) in instant_strategy(),
        start in bound_strategy(),
        end in bound_strategy(),
    ) {
        prop_assume!(start <= end);
        let now = Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap();
        let policy = Policy::new("p", "proc").with_schedule(Schedule {
            start_time: Some(hhmm(start)),
            end_time: Some(hhmm(end)),
            days: None,
        });

        let minutes = h * 60 + mi;
        let expected = minutes >= start.0 * 60 + start.1 && minutes <= end.0 * 60 + end.1;
        prop_assert_eq!(policy.is_active_at(&now), expected);
    }

    /// A window with start after end never matches - midnight
    /// wrap-around is not interpreted.
    #[test]
    fn inverted_window_never_active(
        (y, mo, d, h, mi) in instant_strategy(),
        start in bound_strategy(),
        end in bound_strategy(),
    ) {
        prop_assume!(start > end);
        let now = Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap();
        let policy = Policy::new("p", "proc").with_schedule(Schedule {
            start_time: Some(hhmm(start)),
            end_time: Some(hhmm(end)),
            days: None,
        });
        prop_assert!(!policy.is_active_at(&now));
    }

    /// Day and window constraints compose conjunctively.
    #[test]
    fn combined_schedule_requires_both(
        (y, mo, d, h, mi) in instant_strategy(),
        days in days_strategy(),
        start in bound_strategy(),
        end in bound_strategy(),
    ) {
        prop_assume!(start <= end);
        let now = Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap();
        let policy = Policy::new("p", "proc").with_schedule(Schedule {
            start_time: Some(hhmm(start)),
            end_time: Some(hhmm(end)),
            days: Some(days.clone()),
        });

        let weekday = now.weekday().num_days_from_sunday() as u8;
        let minutes = h * 60 + mi;
        let in_window = minutes >= start.0 * 60 + start.1 && minutes <= end.0 * 60 + end.1;
        prop_assert_eq!(
            policy.is_active_at(&now),
            days.contains(&weekday) && in_window
        );
    }

    // ========================================================================
    // Connection Escalation Properties
    // ========================================================================

    /// After n consecutive failures the state is a pure function of n:
    /// CONNECTING below 3, DEGRADED from 3, OFFLINE from 15.
    #[test]
    fn escalation_is_pure_function_of_failure_count(n in 0u32..40) {
        let monitor = paired_monitor();
        for _ in 0..n {
            monitor.on_sync_failure();
        }

        let expected = if n >= 15 {
            ConnectionState::Offline
        } else if n >= 3 {
            ConnectionState::Degraded
        } else {
            ConnectionState::Connecting
        };
        prop_assert_eq!(monitor.state(), expected);
        prop_assert_eq!(monitor.consecutive_failures(), n);
    }

    /// One success resets the failure count and lands ONLINE from any
    /// failure depth.
    #[test]
    fn success_resets_any_failure_depth(n in 0u32..40) {
        let monitor = paired_monitor();
        for _ in 0..n {
            monitor.on_sync_failure();
        }

        monitor.on_sync_success();
        prop_assert_eq!(monitor.state(), ConnectionState::Online);
        prop_assert_eq!(monitor.consecutive_failures(), 0);
    }

    /// The retry interval follows the state, not the failure count:
    /// 30s connecting, 120s degraded, 600s offline, and the caller's
    /// interval while online.
    #[test]
    fn retry_interval_follows_state(n in 0u32..40, online_secs in 1u64..3600) {
        let monitor = paired_monitor();
        for _ in 0..n {
            monitor.on_sync_failure();
        }

        let online = Duration::from_secs(online_secs);
        let expected = match monitor.state() {
            ConnectionState::Online => online,
            ConnectionState::Unconfigured | ConnectionState::Connecting => {
                Duration::from_secs(30)
            },
            ConnectionState::Degraded => Duration::from_secs(120),
            ConnectionState::Offline => Duration::from_secs(600),
        };
        prop_assert_eq!(monitor.retry_interval(online), expected);

        monitor.on_sync_success();
        prop_assert_eq!(monitor.retry_interval(online), online);
    }
}
