use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Session events feeding auto-status derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Commit,
    Test,
    Edit,
    Read,
    Message,
}

/// Rolling window of recent session events (60 s horizon).
#[derive(Debug, Default)]
pub struct EventWindow {
    events: VecDeque<(DateTime<Utc>, EventKind)>,
}

const WINDOW_SECS: i64 = 60;

impl EventWindow {
    pub fn record(&mut self, kind: EventKind) {
        self.record_at(Utc::now(), kind);
    }

    pub fn record_at(&mut self, at: DateTime<Utc>, kind: EventKind) {
        self.events.push_back((at, kind));
        self.expire(at);
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::seconds(WINDOW_SECS);
        while self
            .events
            .front()
            .is_some_and(|(at, _)| *at < horizon)
        {
            self.events.pop_front();
        }
    }

    pub fn count(&self, kind: EventKind, now: DateTime<Utc>) -> usize {
        let horizon = now - Duration::seconds(WINDOW_SECS);
        self.events
            .iter()
            .filter(|(at, k)| *at >= horizon && *k == kind)
            .count()
    }
}

/// Derive a short status string from the recent-event window.
pub fn auto_status(
    now: DateTime<Utc>,
    started_at: DateTime<Utc>,
    window: &EventWindow,
    last_activity: Option<&str>,
) -> String {
    if now - started_at < Duration::seconds(30) {
        return "just arrived".into();
    }
    if window.count(EventKind::Commit, now) >= 1 {
        return "just shipped".into();
    }
    if window.count(EventKind::Test, now) >= 3 {
        return "debugging...".into();
    }
    if window.count(EventKind::Edit, now) >= 8 {
        return "on fire".into();
    }
    if window.count(EventKind::Read, now) >= 1 && window.count(EventKind::Edit, now) == 0 {
        return "exploring the codebase".into();
    }
    last_activity.unwrap_or("").to_string()
}

/// Coarse liveness tier for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTier {
    Active,
    Idle,
    Away,
    Stuck,
}

impl std::fmt::Display for StatusTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Away => write!(f, "away"),
            Self::Stuck => write!(f, "stuck"),
        }
    }
}

/// Classify an agent by the age of its last activity.
///
/// `holds_work` is true when the agent has an active claim or reservation:
/// silent-but-holding crosses into `stuck` at `stuck_threshold_secs`,
/// silent-and-idle is merely `away`.
pub fn status_tier(
    now: DateTime<Utc>,
    last_activity_at: Option<DateTime<Utc>>,
    holds_work: bool,
    stuck_threshold_secs: u64,
) -> StatusTier {
    let Some(last) = last_activity_at else {
        return if holds_work {
            StatusTier::Stuck
        } else {
            StatusTier::Away
        };
    };
    let idle = (now - last).num_seconds().max(0) as u64;

    if holds_work && idle >= stuck_threshold_secs {
        return StatusTier::Stuck;
    }
    if idle < 30 {
        StatusTier::Active
    } else if idle < 300 || holds_work {
        // Holding a task or reservation keeps an agent at `idle` until the
        // stuck threshold; `away` is reserved for empty-handed silence.
        StatusTier::Idle
    } else {
        StatusTier::Away
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seconds_ago(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        now - Duration::seconds(secs)
    }

    #[test]
    fn just_arrived_wins_first() {
        let now = Utc::now();
        let window = EventWindow::default();
        assert_eq!(
            auto_status(now, seconds_ago(now, 10), &window, Some("working")),
            "just arrived"
        );
    }

    #[test]
    fn commit_beats_tests_and_edits() {
        let now = Utc::now();
        let mut window = EventWindow::default();
        window.record_at(seconds_ago(now, 5), EventKind::Commit);
        for _ in 0..5 {
            window.record_at(seconds_ago(now, 4), EventKind::Test);
        }
        assert_eq!(
            auto_status(now, seconds_ago(now, 3600), &window, None),
            "just shipped"
        );
    }

    #[test]
    fn repeated_tests_mean_debugging() {
        let now = Utc::now();
        let mut window = EventWindow::default();
        for _ in 0..3 {
            window.record_at(seconds_ago(now, 10), EventKind::Test);
        }
        assert_eq!(
            auto_status(now, seconds_ago(now, 3600), &window, None),
            "debugging..."
        );
    }

    #[test]
    fn edit_burst_means_on_fire() {
        let now = Utc::now();
        let mut window = EventWindow::default();
        for _ in 0..8 {
            window.record_at(seconds_ago(now, 10), EventKind::Edit);
        }
        assert_eq!(
            auto_status(now, seconds_ago(now, 3600), &window, None),
            "on fire"
        );
    }

    #[test]
    fn reads_without_edits_mean_exploring() {
        let now = Utc::now();
        let mut window = EventWindow::default();
        window.record_at(seconds_ago(now, 10), EventKind::Read);
        assert_eq!(
            auto_status(now, seconds_ago(now, 3600), &window, None),
            "exploring the codebase"
        );

        window.record_at(seconds_ago(now, 5), EventKind::Edit);
        assert_eq!(auto_status(now, seconds_ago(now, 3600), &window, None), "");
    }

    #[test]
    fn falls_back_to_last_activity() {
        let now = Utc::now();
        let window = EventWindow::default();
        assert_eq!(
            auto_status(now, seconds_ago(now, 3600), &window, Some("refactoring")),
            "refactoring"
        );
    }

    #[test]
    fn events_expire_after_window() {
        let now = Utc::now();
        let mut window = EventWindow::default();
        window.record_at(seconds_ago(now, 90), EventKind::Commit);
        assert_eq!(window.count(EventKind::Commit, now), 0);
    }

    #[test]
    fn tier_thresholds() {
        let now = Utc::now();
        let at = |secs| Some(seconds_ago(now, secs));

        assert_eq!(status_tier(now, at(5), false, 900), StatusTier::Active);
        assert_eq!(status_tier(now, at(60), false, 900), StatusTier::Idle);
        assert_eq!(status_tier(now, at(600), false, 900), StatusTier::Away);
        // Holding work keeps an agent out of `away` until stuck.
        assert_eq!(status_tier(now, at(600), true, 900), StatusTier::Idle);
        assert_eq!(status_tier(now, at(1000), true, 900), StatusTier::Stuck);
        assert_eq!(status_tier(now, at(1000), false, 900), StatusTier::Away);
        assert_eq!(status_tier(now, None, false, 900), StatusTier::Away);
    }
}
