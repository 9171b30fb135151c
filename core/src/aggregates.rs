use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::records::ActivationLevel;

/// Volume below which a recently trained muscle is only being maintained.
pub const DEFAULT_VOLUME_THRESHOLD: f64 = 1000.0;
/// Days without training after which a muscle is undertrained.
pub const DEFAULT_UNDERTRAINED_AFTER_DAYS: i64 = 14;
pub const WEEKLY_WINDOW_DAYS: u32 = 7;
pub const MONTHLY_WINDOW_DAYS: u32 = 30;
pub const MAX_WINDOW_DAYS: u32 = 3650;

/// Thresholds for [`TrainingStatus::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StatusPolicy {
    pub volume_threshold: f64,
    pub undertrained_after_days: i64,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            undertrained_after_days: DEFAULT_UNDERTRAINED_AFTER_DAYS,
        }
    }
}

/// Recovery/training label for one muscle over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum TrainingStatus {
    Undertrained,
    Maintenance,
    Optimal,
}

impl TrainingStatus {
    /// First match wins: stale beyond `undertrained_after_days` (strictly greater),
    /// then volume strictly below the threshold, else optimal.
    pub fn classify(
        last_trained: DateTime<Utc>,
        total_volume: f64,
        now: DateTime<Utc>,
        policy: &StatusPolicy,
    ) -> Self {
        if days_since(last_trained, now) > policy.undertrained_after_days {
            Self::Undertrained
        } else if total_volume < policy.volume_threshold {
            Self::Maintenance
        } else {
            Self::Optimal
        }
    }
}

/// Whole days elapsed, floored, never negative.
pub fn days_since(then: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    now.signed_duration_since(then).num_days().max(0)
}

/// Lookback window for volume queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VolumeWindow {
    #[default]
    Weekly,
    Monthly,
    Days(u32),
}

impl VolumeWindow {
    /// Accepts `weekly`, `monthly` or a positive day count.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "weekly" | "week" => Some(Self::Weekly),
            "monthly" | "month" => Some(Self::Monthly),
            other => other
                .parse::<u32>()
                .ok()
                .filter(|days| (1..=MAX_WINDOW_DAYS).contains(days))
                .map(Self::Days),
        }
    }

    pub fn days(self) -> u32 {
        match self {
            Self::Weekly => WEEKLY_WINDOW_DAYS,
            Self::Monthly => MONTHLY_WINDOW_DAYS,
            Self::Days(days) => days,
        }
    }

    pub fn since(self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(i64::from(self.days()))
    }
}

/// One muscle activation joined with its exercise and completed session.
/// The store only yields facts from sessions with an end time.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationFact {
    pub session_id: Uuid,
    pub exercise_id: Uuid,
    pub session_started_at: DateTime<Utc>,
    pub muscle_name: String,
    pub activation_level: ActivationLevel,
    pub estimated_volume: f64,
}

/// Volume for one muscle on one calendar date (UTC, by session start).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MuscleVolumeBucket {
    pub muscle_name: String,
    pub date: NaiveDate,
    pub total_volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MuscleTracking {
    pub muscle_name: String,
    pub total_volume: f64,
    /// Distinct exercises that hit this muscle in the window
    pub exercise_count: u32,
    pub last_trained: DateTime<Utc>,
    pub days_since_last_trained: i64,
    /// Share of the window's total volume, 0..=100
    pub relative_emphasis_pct: f64,
    pub status: TrainingStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VolumePoint {
    pub date: NaiveDate,
    pub volume: f64,
}

/// Per-muscle daily series, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VolumeProgression {
    pub window_days: u32,
    pub muscles: BTreeMap<String, Vec<VolumePoint>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SessionFrequency {
    pub total_sessions: u32,
    pub sessions_per_week: f64,
    /// Days between the first and last session, inclusive
    pub days_tracked: i64,
    /// 0..=100, higher means steadier gaps between sessions
    pub consistency_score: f64,
}

/// Sum activation volume by muscle and date. Sorted by muscle, then date.
pub fn aggregate_volume(facts: &[ActivationFact]) -> Vec<MuscleVolumeBucket> {
    let mut buckets: BTreeMap<(String, NaiveDate), f64> = BTreeMap::new();
    for fact in facts {
        let key = (fact.muscle_name.clone(), fact.session_started_at.date_naive());
        *buckets.entry(key).or_insert(0.0) += fact.estimated_volume;
    }
    buckets
        .into_iter()
        .map(|((muscle_name, date), total_volume)| MuscleVolumeBucket {
            muscle_name,
            date,
            total_volume: round_to_two(total_volume),
        })
        .collect()
}

/// Group by muscle with status. Sorted by volume descending, then name.
pub fn aggregate_tracking(
    facts: &[ActivationFact],
    now: DateTime<Utc>,
    policy: &StatusPolicy,
) -> Vec<MuscleTracking> {
    struct Acc {
        total_volume: f64,
        exercises: HashSet<Uuid>,
        last_trained: DateTime<Utc>,
    }

    let mut by_muscle: HashMap<&str, Acc> = HashMap::new();
    for fact in facts {
        let acc = by_muscle
            .entry(fact.muscle_name.as_str())
            .or_insert_with(|| Acc {
                total_volume: 0.0,
                exercises: HashSet::new(),
                last_trained: fact.session_started_at,
            });
        acc.total_volume += fact.estimated_volume;
        acc.exercises.insert(fact.exercise_id);
        if fact.session_started_at > acc.last_trained {
            acc.last_trained = fact.session_started_at;
        }
    }

    let window_total: f64 = by_muscle.values().map(|acc| acc.total_volume).sum();

    let mut rows: Vec<MuscleTracking> = by_muscle
        .into_iter()
        .map(|(muscle_name, acc)| MuscleTracking {
            muscle_name: muscle_name.to_string(),
            total_volume: round_to_two(acc.total_volume),
            exercise_count: acc.exercises.len() as u32,
            last_trained: acc.last_trained,
            days_since_last_trained: days_since(acc.last_trained, now),
            relative_emphasis_pct: if window_total > 0.0 {
                round_to_two(acc.total_volume / window_total * 100.0)
            } else {
                0.0
            },
            status: TrainingStatus::classify(acc.last_trained, acc.total_volume, now, policy),
        })
        .collect();

    rows.sort_by(|a, b| {
        b.total_volume
            .total_cmp(&a.total_volume)
            .then_with(|| a.muscle_name.cmp(&b.muscle_name))
    });
    rows
}

pub fn volume_progression(buckets: &[MuscleVolumeBucket], window_days: u32) -> VolumeProgression {
    let mut muscles: BTreeMap<String, Vec<VolumePoint>> = BTreeMap::new();
    for bucket in buckets {
        muscles
            .entry(bucket.muscle_name.clone())
            .or_default()
            .push(VolumePoint {
                date: bucket.date,
                volume: bucket.total_volume,
            });
    }
    for series in muscles.values_mut() {
        series.sort_by_key(|point| point.date);
    }
    VolumeProgression {
        window_days,
        muscles,
    }
}

/// Frequency stats over completed session start times.
pub fn session_frequency(session_starts: &[DateTime<Utc>]) -> SessionFrequency {
    let mut starts = session_starts.to_vec();
    starts.sort();

    let (Some(first), Some(last)) = (starts.first(), starts.last()) else {
        return SessionFrequency {
            total_sessions: 0,
            sessions_per_week: 0.0,
            days_tracked: 0,
            consistency_score: 0.0,
        };
    };

    let total_sessions = starts.len() as u32;
    let days_tracked = last.signed_duration_since(*first).num_days() + 1;
    let sessions_per_day = f64::from(total_sessions) / days_tracked as f64;

    let gaps: Vec<f64> = starts
        .windows(2)
        .map(|pair| pair[1].signed_duration_since(pair[0]).num_seconds() as f64)
        .collect();

    let consistency_score = if gaps.is_empty() {
        0.0
    } else {
        let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
        if mean > 0.0 {
            let variance =
                gaps.iter().map(|gap| (gap - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
            let cv = variance.sqrt() / mean;
            (100.0 * (1.0 - cv)).clamp(0.0, 100.0)
        } else {
            0.0
        }
    };

    SessionFrequency {
        total_sessions,
        sessions_per_week: round_to_two(sessions_per_day * 7.0),
        days_tracked,
        consistency_score: round_to_two(consistency_score),
    }
}

fn round_to_two(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    fn fact(
        muscle: &str,
        exercise_id: Uuid,
        started_at: DateTime<Utc>,
        volume: f64,
    ) -> ActivationFact {
        ActivationFact {
            session_id: Uuid::nil(),
            exercise_id,
            session_started_at: started_at,
            muscle_name: muscle.to_string(),
            activation_level: ActivationLevel::Primary,
            estimated_volume: volume,
        }
    }

    #[test]
    fn status_is_undertrained_after_fifteen_days() {
        let now = Utc::now();
        let status = TrainingStatus::classify(
            now - Duration::days(15),
            5000.0,
            now,
            &StatusPolicy::default(),
        );
        assert_eq!(status, TrainingStatus::Undertrained);
    }

    #[test]
    fn status_at_exactly_fourteen_days_falls_to_volume_rule() {
        let now = Utc::now();
        let policy = StatusPolicy::default();
        let last = now - Duration::days(14);
        assert_eq!(
            TrainingStatus::classify(last, 1500.0, now, &policy),
            TrainingStatus::Optimal
        );
        assert_eq!(
            TrainingStatus::classify(last, 500.0, now, &policy),
            TrainingStatus::Maintenance
        );
    }

    #[test]
    fn status_uses_volume_threshold_for_recent_muscles() {
        let now = Utc::now();
        let policy = StatusPolicy::default();
        let last = now - Duration::days(5);
        assert_eq!(
            TrainingStatus::classify(last, 500.0, now, &policy),
            TrainingStatus::Maintenance
        );
        assert_eq!(
            TrainingStatus::classify(last, 1500.0, now, &policy),
            TrainingStatus::Optimal
        );
        assert_eq!(
            TrainingStatus::classify(last, 1000.0, now, &policy),
            TrainingStatus::Optimal
        );
    }

    #[test]
    fn status_policy_is_configurable() {
        let now = Utc::now();
        let policy = StatusPolicy {
            volume_threshold: 200.0,
            undertrained_after_days: 3,
        };
        assert_eq!(
            TrainingStatus::classify(now - Duration::days(4), 5000.0, now, &policy),
            TrainingStatus::Undertrained
        );
        assert_eq!(
            TrainingStatus::classify(now, 250.0, now, &policy),
            TrainingStatus::Optimal
        );
    }

    #[test]
    fn window_parses_names_and_day_counts() {
        assert_eq!(VolumeWindow::parse("weekly"), Some(VolumeWindow::Weekly));
        assert_eq!(VolumeWindow::parse("Monthly"), Some(VolumeWindow::Monthly));
        assert_eq!(VolumeWindow::parse("90"), Some(VolumeWindow::Days(90)));
        assert_eq!(VolumeWindow::parse("0"), None);
        assert_eq!(VolumeWindow::parse("fortnight"), None);
        assert_eq!(VolumeWindow::Monthly.days(), 30);
    }

    #[test]
    fn volume_groups_by_muscle_and_calendar_date() {
        let day1 = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let day1_evening = Utc.with_ymd_and_hms(2026, 3, 2, 19, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 0).unwrap();
        let facts = vec![
            fact("chest", Uuid::now_v7(), day1, 1000.0),
            fact("chest", Uuid::now_v7(), day1_evening, 500.0),
            fact("chest", Uuid::now_v7(), day2, 200.0),
            fact("back", Uuid::now_v7(), day2, 800.0),
        ];

        let buckets = aggregate_volume(&facts);
        let flat: Vec<(&str, NaiveDate, f64)> = buckets
            .iter()
            .map(|b| (b.muscle_name.as_str(), b.date, b.total_volume))
            .collect();
        assert_eq!(
            flat,
            vec![
                ("back", day2.date_naive(), 800.0),
                ("chest", day1.date_naive(), 1500.0),
                ("chest", day2.date_naive(), 200.0),
            ]
        );

        let progression = volume_progression(&buckets, 7);
        assert_eq!(progression.muscles["chest"].len(), 2);
        assert_eq!(progression.muscles["chest"][0].volume, 1500.0);
        assert_eq!(progression.window_days, 7);
    }

    #[test]
    fn tracking_counts_distinct_exercises_and_latest_session() {
        let now = Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap();
        let bench = Uuid::now_v7();
        let fly = Uuid::now_v7();
        let squat = Uuid::now_v7();
        let facts = vec![
            fact("chest", bench, now - Duration::days(5), 900.0),
            fact("chest", fly, now - Duration::days(2), 600.0),
            fact("quadriceps", squat, now - Duration::days(16), 500.0),
        ];

        let rows = aggregate_tracking(&facts, now, &StatusPolicy::default());
        assert_eq!(rows.len(), 2);

        let chest = &rows[0];
        assert_eq!(chest.muscle_name, "chest");
        assert_eq!(chest.total_volume, 1500.0);
        assert_eq!(chest.exercise_count, 2);
        assert_eq!(chest.last_trained, now - Duration::days(2));
        assert_eq!(chest.days_since_last_trained, 2);
        assert_eq!(chest.relative_emphasis_pct, 75.0);
        assert_eq!(chest.status, TrainingStatus::Optimal);

        let quads = &rows[1];
        assert_eq!(quads.status, TrainingStatus::Undertrained);
        assert_eq!(quads.relative_emphasis_pct, 25.0);
    }

    #[test]
    fn tracking_of_no_facts_is_empty() {
        assert!(aggregate_tracking(&[], Utc::now(), &StatusPolicy::default()).is_empty());
    }

    #[test]
    fn frequency_of_evenly_spaced_sessions_is_fully_consistent() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 7, 0, 0).unwrap();
        let starts: Vec<_> = (0..4).map(|i| start + Duration::days(2 * i)).collect();
        let stats = session_frequency(&starts);
        assert_eq!(stats.total_sessions, 4);
        assert_eq!(stats.days_tracked, 7);
        assert_eq!(stats.sessions_per_week, 4.0);
        assert_eq!(stats.consistency_score, 100.0);
    }

    #[test]
    fn frequency_penalises_irregular_gaps() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 7, 0, 0).unwrap();
        let starts = vec![
            start,
            start + Duration::days(1),
            start + Duration::days(10),
        ];
        let stats = session_frequency(&starts);
        assert!(stats.consistency_score < 30.0);
        assert_eq!(stats.days_tracked, 11);
    }

    #[test]
    fn frequency_handles_single_and_empty_inputs() {
        assert_eq!(session_frequency(&[]).total_sessions, 0);
        let single = session_frequency(&[Utc::now()]);
        assert_eq!(single.total_sessions, 1);
        assert_eq!(single.days_tracked, 1);
        assert_eq!(single.consistency_score, 0.0);
        assert_eq!(single.sessions_per_week, 7.0);
    }
}
