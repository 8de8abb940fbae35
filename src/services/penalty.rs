//! No-show penalty ledger with sliding-window bans
//!
//! Penalty events are append-only per user. Ban state is derived: once the
//! points inside the trailing window reach the threshold, a ban is recorded
//! for a fixed period. Expiry is lazy: `is_banned` clears an expired record
//! as a side effect of the check. `expire_bans` is the explicit sweep for
//! callers that need side-effect-free reads.

use crate::domain::types::{PenaltyEvent, PenaltyReason, Timestamp, UserId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenaltyPolicy {
    pub window_days: i64,
    pub ban_threshold: u32,
    pub ban_period_days: i64,
}

impl Default for PenaltyPolicy {
    fn default() -> Self {
        Self { window_days: 30, ban_threshold: 3, ban_period_days: 7 }
    }
}

/// Storage for penalty events and ban records
pub trait PenaltyRepository: Send + Sync {
    fn append(&self, event: PenaltyEvent);
    fn events_since(&self, user: &UserId, since: Timestamp) -> Vec<PenaltyEvent>;
    fn total_count(&self, user: &UserId) -> usize;
    fn ban_until(&self, user: &UserId) -> Option<Timestamp>;
    fn set_ban(&self, user: &UserId, until: Timestamp);
    fn clear_ban(&self, user: &UserId);
    fn banned_users(&self) -> Vec<(UserId, Timestamp)>;
    fn clear_user(&self, user: &UserId);
}

#[derive(Default)]
pub struct InMemoryPenaltyRepository {
    events: Mutex<FxHashMap<UserId, Vec<PenaltyEvent>>>,
    bans: Mutex<FxHashMap<UserId, Timestamp>>,
}

impl InMemoryPenaltyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PenaltyRepository for InMemoryPenaltyRepository {
    fn append(&self, event: PenaltyEvent) {
        self.events.lock().entry(event.user_id.clone()).or_default().push(event);
    }

    fn events_since(&self, user: &UserId, since: Timestamp) -> Vec<PenaltyEvent> {
        self.events
            .lock()
            .get(user)
            .map(|events| events.iter().filter(|e| e.at >= since).cloned().collect())
            .unwrap_or_default()
    }

    fn total_count(&self, user: &UserId) -> usize {
        self.events.lock().get(user).map_or(0, Vec::len)
    }

    fn ban_until(&self, user: &UserId) -> Option<Timestamp> {
        self.bans.lock().get(user).copied()
    }

    fn set_ban(&self, user: &UserId, until: Timestamp) {
        self.bans.lock().insert(user.clone(), until);
    }

    fn clear_ban(&self, user: &UserId) {
        self.bans.lock().remove(user);
    }

    fn banned_users(&self) -> Vec<(UserId, Timestamp)> {
        self.bans.lock().iter().map(|(u, t)| (u.clone(), *t)).collect()
    }

    fn clear_user(&self, user: &UserId) {
        self.events.lock().remove(user);
        self.bans.lock().remove(user);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PenaltySummary {
    pub user_id: UserId,
    pub points: u32,
    pub window_days: i64,
    pub threshold: u32,
    pub is_banned: bool,
    pub ban_until: Option<Timestamp>,
    pub total_penalty_count: usize,
}

pub struct PenaltyLedger<R: PenaltyRepository = InMemoryPenaltyRepository> {
    repo: R,
    policy: PenaltyPolicy,
    /// Keeps append + ban decision atomic per ledger
    lock: Mutex<()>,
}

impl PenaltyLedger<InMemoryPenaltyRepository> {
    pub fn in_memory(policy: PenaltyPolicy) -> Self {
        Self::new(InMemoryPenaltyRepository::new(), policy)
    }
}

impl<R: PenaltyRepository> PenaltyLedger<R> {
    pub fn new(repo: R, policy: PenaltyPolicy) -> Self {
        info!(
            window_days = %policy.window_days,
            ban_threshold = %policy.ban_threshold,
            ban_period_days = %policy.ban_period_days,
            "penalty_policy_loaded"
        );
        Self { repo, policy, lock: Mutex::new(()) }
    }

    pub fn policy(&self) -> &PenaltyPolicy {
        &self.policy
    }

    /// Record one point and return the user's all-time penalty count
    pub fn add_penalty(&self, user: &UserId, reason: PenaltyReason, now: Timestamp) -> usize {
        let _guard = self.lock.lock();

        self.repo.append(PenaltyEvent {
            user_id: user.clone(),
            reason: reason.clone(),
            points: 1,
            at: now,
        });

        let points = self.points_inner(user, now);
        let total = self.repo.total_count(user);

        if points >= self.policy.ban_threshold && !self.is_banned_inner(user, now) {
            let until = now + chrono::Duration::days(self.policy.ban_period_days);
            self.repo.set_ban(user, until);
            info!(user_id = %user, points = %points, ban_until = %until, "user_banned");
        }

        info!(
            user_id = %user,
            reason = %reason,
            points = %points,
            total = %total,
            "penalty_added"
        );
        total
    }

    /// Read with side effect: an expired ban record is removed here
    pub fn is_banned(&self, user: &UserId, now: Timestamp) -> bool {
        let _guard = self.lock.lock();
        self.is_banned_inner(user, now)
    }

    /// Points inside the trailing window ending at `now`
    pub fn points(&self, user: &UserId, now: Timestamp) -> u32 {
        self.points_inner(user, now)
    }

    pub fn penalty_count(&self, user: &UserId) -> usize {
        self.repo.total_count(user)
    }

    pub fn ban_until(&self, user: &UserId) -> Option<Timestamp> {
        self.repo.ban_until(user)
    }

    pub fn summary(&self, user: &UserId, now: Timestamp) -> PenaltySummary {
        let _guard = self.lock.lock();
        let is_banned = self.is_banned_inner(user, now);
        PenaltySummary {
            user_id: user.clone(),
            points: self.points_inner(user, now),
            window_days: self.policy.window_days,
            threshold: self.policy.ban_threshold,
            is_banned,
            ban_until: self.repo.ban_until(user),
            total_penalty_count: self.repo.total_count(user),
        }
    }

    /// Drop every event and ban for the user
    pub fn reset_user(&self, user: &UserId) {
        let _guard = self.lock.lock();
        self.repo.clear_user(user);
        info!(user_id = %user, "penalty_user_reset");
    }

    /// Clear all expired bans, returning how many were removed
    pub fn expire_bans(&self, now: Timestamp) -> usize {
        let _guard = self.lock.lock();
        let mut cleared = 0;
        for (user, until) in self.repo.banned_users() {
            if now >= until {
                self.repo.clear_ban(&user);
                cleared += 1;
            }
        }
        cleared
    }

    fn is_banned_inner(&self, user: &UserId, now: Timestamp) -> bool {
        match self.repo.ban_until(user) {
            None => false,
            Some(until) if now >= until => {
                self.repo.clear_ban(user);
                info!(user_id = %user, ban_until = %until, "ban_expired");
                false
            }
            Some(_) => true,
        }
    }

    fn points_inner(&self, user: &UserId, now: Timestamp) -> u32 {
        let since = now - chrono::Duration::days(self.policy.window_days);
        self.repo.events_since(user, since).iter().map(|e| e.points).sum()
    }
}
