use chrono::NaiveDate;
use serde::Serialize;

use crate::model::UserProgress;

/// Result of evaluating the streak rule for one day of activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreakUpdate {
    pub current_streak: u32,
    pub longest_streak: u32,
    pub changed: bool,
}

/// The daily streak state machine, evaluated at the first practice activity
/// of a calendar day. Same day: no change. Consecutive day: extend. Any gap
/// or no history: reset to 1. The longest streak only ever grows.
pub fn advance_streak(
    current: u32,
    longest: u32,
    last_practice: Option<NaiveDate>,
    today: NaiveDate,
) -> StreakUpdate {
    let (current_streak, changed) = match last_practice {
        Some(last) => {
            let gap = (today - last).num_days();
            if gap == 0 {
                (current, false)
            } else if gap == 1 {
                (current + 1, true)
            } else {
                (1, true)
            }
        }
        None => (1, true),
    };
    StreakUpdate {
        current_streak,
        longest_streak: longest.max(current_streak),
        changed,
    }
}

/// Session durations come from client timers; clamp out corrupt values.
pub fn clamp_minutes(minutes: u32, max_session_minutes: u32) -> u32 {
    minutes.min(max_session_minutes)
}

/// Mean of the attempt scores for a completed conversation. Zero when there
/// are no attempts: an abandoned session, not an error.
pub fn success_rate(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

/// Read model for the streak surface: whether today is already counted and
/// whether yesterday's streak is about to break.
#[derive(Debug, Clone, Serialize)]
pub struct StreakStatus {
    pub current_streak: u32,
    pub longest_streak: u32,
    pub practiced_today: bool,
    pub streak_at_risk: bool,
    pub last_practice_date: Option<NaiveDate>,
}

pub fn streak_status(progress: &UserProgress, today: NaiveDate) -> StreakStatus {
    let practiced_today = progress.last_practice_date == Some(today);
    let streak_at_risk = !practiced_today
        && progress
            .last_practice_date
            .map(|last| (today - last).num_days() == 1)
            .unwrap_or(false);
    StreakStatus {
        current_streak: progress.current_streak,
        longest_streak: progress.longest_streak,
        practiced_today,
        streak_at_risk,
        last_practice_date: progress.last_practice_date,
    }
}
