use std::collections::HashSet;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::debug;

use crate::snapshots::Snapshot;

use super::policy::{PolicyError, RetentionPolicy};

/// Which snapshots to keep and which to hand to the engine's forget call.
/// Both lists are ordered newest-first and contain no duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionDecision {
    pub keep: Vec<String>,
    pub prune: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Bucket {
    Last,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Bucket {
    /// Calendar-aligned unit key (UTC). Two snapshots with the same key
    /// compete for the same slot within this bucket.
    fn unit_key(&self, snapshot: &Snapshot) -> String {
        let ts: &DateTime<Utc> = &snapshot.timestamp;
        match self {
            // Every snapshot is its own unit: "last N" plain and simple.
            Bucket::Last => snapshot.id.clone(),
            Bucket::Hourly => format!("{}-{:02}-{:02}T{:02}", ts.year(), ts.month(), ts.day(), ts.hour()),
            Bucket::Daily => format!("{}-{:02}-{:02}", ts.year(), ts.month(), ts.day()),
            Bucket::Weekly => {
                let week = ts.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Bucket::Monthly => format!("{}-{:02}", ts.year(), ts.month()),
            Bucket::Yearly => format!("{}", ts.year()),
        }
    }
}

/// Compute the keep/prune split for one repository's snapshots.
///
/// Pure function: no I/O, no mutation. Snapshots are walked newest-first
/// (ties broken toward the lexicographically smaller id, so the result is
/// reproducible); each enabled bucket keeps at most one snapshot per
/// calendar unit up to its count, and the bucket keep-sets are unioned.
/// Snapshots carrying `protect_tag` are always kept.
///
/// The policy is re-validated here even though configuration loading already
/// rejects all-zero policies.
pub fn evaluate(
    snapshots: &[Snapshot],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    protect_tag: &str,
) -> Result<RetentionDecision, PolicyError> {
    policy.validate()?;

    if snapshots.is_empty() {
        return Ok(RetentionDecision::default());
    }

    let mut sorted: Vec<&Snapshot> = snapshots.iter().collect();
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));

    let mut keep_set: HashSet<&str> = HashSet::new();

    for snapshot in &sorted {
        if snapshot.has_tag(protect_tag) {
            keep_set.insert(snapshot.id.as_str());
        }
    }

    let buckets = [
        (policy.last, Bucket::Last),
        (policy.hourly, Bucket::Hourly),
        (policy.daily, Bucket::Daily),
        (policy.weekly, Bucket::Weekly),
        (policy.monthly, Bucket::Monthly),
        (policy.yearly, Bucket::Yearly),
    ];

    for (count, bucket) in buckets {
        if count == 0 {
            continue;
        }
        let mut seen_units: HashSet<String> = HashSet::new();
        let mut kept = 0u32;
        for snapshot in &sorted {
            if kept >= count {
                break;
            }
            if !seen_units.insert(bucket.unit_key(snapshot)) {
                continue;
            }
            kept += 1;
            // Counts toward the quota whether or not another bucket (or the
            // protect tag) already keeps it.
            keep_set.insert(snapshot.id.as_str());
        }
    }

    let mut keep = Vec::new();
    let mut prune = Vec::new();
    for snapshot in &sorted {
        if keep_set.contains(snapshot.id.as_str()) {
            keep.push(snapshot.id.clone());
        } else {
            prune.push(snapshot.id.clone());
        }
    }

    debug!(
        repository_id = %policy.repository_id,
        %now,
        total = snapshots.len(),
        keep = keep.len(),
        prune = prune.len(),
        "Retention evaluated"
    );

    Ok(RetentionDecision { keep, prune })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot(id: &str, ts: DateTime<Utc>, tags: &[&str]) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            short_id: Snapshot::short_id_of(id),
            repository_id: "repo-1".to_string(),
            timestamp: ts,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            paths: vec!["/data".to_string()],
            total_size: 1024,
            file_count: 3,
        }
    }

    fn policy(last: u32, hourly: u32, daily: u32, weekly: u32, monthly: u32, yearly: u32) -> RetentionPolicy {
        RetentionPolicy {
            repository_id: "repo-1".to_string(),
            last,
            hourly,
            daily,
            weekly,
            monthly,
            yearly,
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_empty_input() {
        let decision = evaluate(&[], &policy(1, 0, 0, 0, 0, 0), Utc::now(), "protect").unwrap();
        assert!(decision.keep.is_empty());
        assert!(decision.prune.is_empty());
    }

    #[test]
    fn test_all_zero_policy_rejected_defensively() {
        let snaps = vec![snapshot("a", at(2026, 1, 1, 0), &[])];
        let err = evaluate(&snaps, &policy(0, 0, 0, 0, 0, 0), Utc::now(), "protect").unwrap_err();
        assert!(matches!(err, PolicyError::AllBucketsDisabled(_)));
    }

    #[test]
    fn test_last_one_keeps_only_most_recent() {
        let snaps: Vec<Snapshot> = (0..8)
            .map(|i| snapshot(&format!("snap-{i}"), at(2026, 3, 1 + i, 12), &[]))
            .collect();

        let decision = evaluate(&snaps, &policy(1, 0, 0, 0, 0, 0), Utc::now(), "protect").unwrap();
        assert_eq!(decision.keep, vec!["snap-7".to_string()]);
        assert_eq!(decision.prune.len(), 7);
    }

    #[test]
    fn test_daily_three_over_ten_days() {
        let snaps: Vec<Snapshot> = (0..10)
            .map(|i| snapshot(&format!("snap-{i:02}"), at(2026, 5, 1 + i, 9), &[]))
            .collect();

        let decision = evaluate(&snaps, &policy(0, 0, 3, 0, 0, 0), Utc::now(), "protect").unwrap();
        assert_eq!(decision.keep, vec!["snap-09", "snap-08", "snap-07"]);
        assert_eq!(decision.prune.len(), 7);
    }

    #[test]
    fn test_daily_keeps_most_recent_per_day() {
        let snaps = vec![
            snapshot("morning", at(2026, 5, 1, 6), &[]),
            snapshot("evening", at(2026, 5, 1, 20), &[]),
        ];

        let decision = evaluate(&snaps, &policy(0, 0, 2, 0, 0, 0), Utc::now(), "protect").unwrap();
        assert_eq!(decision.keep, vec!["evening"]);
        assert_eq!(decision.prune, vec!["morning"]);
    }

    #[test]
    fn test_identical_timestamp_tie_breaks_to_smaller_id() {
        let ts = at(2026, 5, 1, 12);
        let snaps = vec![snapshot("bbb", ts, &[]), snapshot("aaa", ts, &[])];

        let decision = evaluate(&snaps, &policy(0, 0, 1, 0, 0, 0), Utc::now(), "protect").unwrap();
        assert_eq!(decision.keep, vec!["aaa"]);
        assert_eq!(decision.prune, vec!["bbb"]);
    }

    #[test]
    fn test_bucket_union_has_no_duplicates() {
        // Most recent snapshot is eligible for daily and weekly at once.
        let snaps = vec![
            snapshot("new", at(2026, 5, 7, 12), &[]),
            snapshot("old", at(2026, 4, 1, 12), &[]),
        ];

        let decision = evaluate(&snaps, &policy(0, 0, 1, 1, 0, 0), Utc::now(), "protect").unwrap();
        let unique: HashSet<&String> = decision.keep.iter().collect();
        assert_eq!(unique.len(), decision.keep.len());
        assert!(decision.keep.contains(&"new".to_string()));
    }

    #[test]
    fn test_shared_snapshot_counts_toward_both_quotas() {
        // Same snapshot satisfies daily:1 and weekly:1; nothing else should
        // be pulled into the keep-set to fill the weekly slot.
        let snaps = vec![
            snapshot("latest", at(2026, 5, 7, 12), &[]),
            snapshot("same-week", at(2026, 5, 6, 12), &[]),
        ];

        let decision = evaluate(&snaps, &policy(0, 0, 1, 1, 0, 0), Utc::now(), "protect").unwrap();
        assert_eq!(decision.keep, vec!["latest"]);
        assert_eq!(decision.prune, vec!["same-week"]);
    }

    #[test]
    fn test_weekly_uses_iso_weeks() {
        // 2026-01-04 is a Sunday (ISO week 1), 2026-01-05 a Monday (week 2).
        let snaps = vec![
            snapshot("mon", at(2026, 1, 5, 12), &[]),
            snapshot("sun", at(2026, 1, 4, 12), &[]),
        ];

        let decision = evaluate(&snaps, &policy(0, 0, 0, 2, 0, 0), Utc::now(), "protect").unwrap();
        assert_eq!(decision.keep, vec!["mon", "sun"]);
        assert!(decision.prune.is_empty());
    }

    #[test]
    fn test_monthly_and_yearly() {
        let snaps = vec![
            snapshot("jan", at(2026, 1, 15, 0), &[]),
            snapshot("feb", at(2026, 2, 15, 0), &[]),
            snapshot("prev-year", at(2025, 6, 1, 0), &[]),
        ];

        let decision = evaluate(&snaps, &policy(0, 0, 0, 0, 2, 2), Utc::now(), "protect").unwrap();
        // monthly keeps feb+jan, yearly keeps feb (2026) + prev-year (2025)
        assert_eq!(decision.keep, vec!["feb", "jan", "prev-year"]);
        assert!(decision.prune.is_empty());
    }

    #[test]
    fn test_protect_tag_always_kept() {
        let snaps = vec![
            snapshot("new", at(2026, 5, 7, 12), &[]),
            snapshot("precious", at(2020, 1, 1, 0), &["protect"]),
            snapshot("old", at(2021, 1, 1, 0), &[]),
        ];

        let decision = evaluate(&snaps, &policy(1, 0, 0, 0, 0, 0), Utc::now(), "protect").unwrap();
        assert!(decision.keep.contains(&"precious".to_string()));
        assert!(decision.keep.contains(&"new".to_string()));
        assert_eq!(decision.prune, vec!["old"]);
    }

    #[test]
    fn test_hourly_collapses_within_hour() {
        let base = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let snaps = vec![
            snapshot("h10-early", base + chrono::Duration::minutes(5), &[]),
            snapshot("h10-late", base + chrono::Duration::minutes(50), &[]),
            snapshot("h11", base + chrono::Duration::minutes(70), &[]),
        ];

        let decision = evaluate(&snaps, &policy(0, 2, 0, 0, 0, 0), Utc::now(), "protect").unwrap();
        assert_eq!(decision.keep, vec!["h11", "h10-late"]);
        assert_eq!(decision.prune, vec!["h10-early"]);
    }
}
