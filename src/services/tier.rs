// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Tier gate: pure quota decisions made before any billable work.
//!
//! Nothing here writes. The monthly counter is reset by the store on the next
//! successful increment (see `PipelineStore::increment_sync_count`).

use crate::models::{Tier, UserRecord};
use crate::time_utils::same_calendar_month;
use chrono::{DateTime, Utc};

pub const FREE_TIER_SYNCS_PER_MONTH: u32 = 25;
pub const FREE_TIER_MAX_CONNECTIONS: usize = 2;

const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// Result of a gate check. A denial carries a reason meant for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Denied(String),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            GateDecision::Allowed => None,
            GateDecision::Denied(reason) => Some(reason),
        }
    }
}

/// Tier actually applied: admins and users with an active trial get Pro.
pub fn effective_tier(user: &UserRecord, now: DateTime<Utc>) -> Tier {
    if user.is_admin {
        return Tier::Pro;
    }
    if user.trial_ends_at.is_some_and(|end| now < end) {
        return Tier::Pro;
    }
    user.tier
}

/// Whole days left in the trial, rounded up. `0` once the trial has ended
/// (including exactly now), `-1` when no trial was granted.
pub fn trial_days_remaining(user: &UserRecord, now: DateTime<Utc>) -> i64 {
    let Some(end) = user.trial_ends_at else {
        return -1;
    };
    let remaining = (end - now).num_seconds();
    if remaining <= 0 {
        return 0;
    }
    (remaining + SECS_PER_DAY - 1) / SECS_PER_DAY
}

/// True when the stored counter belongs to an earlier month (or was never reset).
pub fn should_reset_sync_count(user: &UserRecord, now: DateTime<Utc>) -> bool {
    match user.sync_count_reset_at {
        Some(reset_at) => !same_calendar_month(reset_at, now),
        None => true,
    }
}

/// Syncs that count against this month's quota.
///
/// A counter stamped in an earlier month is logically zero. A counter that
/// was never stamped is taken at face value.
pub fn effective_sync_count(user: &UserRecord, now: DateTime<Utc>) -> u32 {
    match user.sync_count_reset_at {
        Some(reset_at) if !same_calendar_month(reset_at, now) => 0,
        _ => user.sync_count_this_month,
    }
}

pub fn can_sync(user: &UserRecord, now: DateTime<Utc>) -> GateDecision {
    if effective_tier(user, now) == Tier::Pro {
        return GateDecision::Allowed;
    }
    if effective_sync_count(user, now) >= FREE_TIER_SYNCS_PER_MONTH {
        return GateDecision::Denied(format!(
            "Free tier limit reached ({}/month). Upgrade to Pro for unlimited syncs.",
            FREE_TIER_SYNCS_PER_MONTH
        ));
    }
    GateDecision::Allowed
}

pub fn can_add_connection(
    user: &UserRecord,
    current_connections: usize,
    now: DateTime<Utc>,
) -> GateDecision {
    if effective_tier(user, now) == Tier::Pro {
        return GateDecision::Allowed;
    }
    if current_connections >= FREE_TIER_MAX_CONNECTIONS {
        return GateDecision::Denied(format!(
            "Free tier limited to {} connections. Upgrade to Pro for unlimited.",
            FREE_TIER_MAX_CONNECTIONS
        ));
    }
    GateDecision::Allowed
}
