// SnapGuard retention.rs
// Purpose: Age- and count-based snapshot eviction

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::RetentionSettings;
use crate::errors::{SnapError, SnapResult};
use crate::lock::{held_target, ROLLBACK_LOCK_FILE};
use crate::registry::RegistryEntry;
use crate::store::SnapshotStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
    pub max_count: usize,
}

impl From<RetentionSettings> for RetentionPolicy {
    fn from(settings: RetentionSettings) -> Self {
        Self {
            max_age_days: settings.max_age_days,
            max_count: settings.max_count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub remaining: usize,
}

/// Ids to delete, oldest first.
///
/// The newest entry and every id in `protected` survive regardless of either
/// policy, so the count bound may be exceeded when too much is protected.
pub fn plan(
    policy: &RetentionPolicy,
    entries: &[RegistryEntry],
    protected: &HashSet<String>,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut oldest_first: Vec<&RegistryEntry> = entries.iter().collect();
    oldest_first.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
    });

    let newest = oldest_first.last().map(|e| e.snapshot_id.clone());
    let removable = |entry: &RegistryEntry| {
        Some(&entry.snapshot_id) != newest.as_ref() && !protected.contains(&entry.snapshot_id)
    };

    let cutoff = now - Duration::days(i64::from(policy.max_age_days));
    let mut doomed: Vec<String> = oldest_first
        .iter()
        .filter(|e| e.created_at < cutoff && removable(**e))
        .map(|e| e.snapshot_id.clone())
        .collect();

    let mut remaining = entries.len() - doomed.len();
    for entry in &oldest_first {
        if remaining <= policy.max_count {
            break;
        }
        if doomed.contains(&entry.snapshot_id) || !removable(*entry) {
            continue;
        }
        doomed.push(entry.snapshot_id.clone());
        remaining -= 1;
    }

    doomed
}

/// Apply `policy` to the store, never touching `protected` ids or the
/// target of a rollback running in any process.
pub fn prune(
    store: &SnapshotStore,
    policy: &RetentionPolicy,
    protected: &HashSet<String>,
) -> SnapResult<PruneReport> {
    let mut protected = protected.clone();
    if let Some(target) = held_target(&store.root().join(ROLLBACK_LOCK_FILE))? {
        debug!("rollback to {target} in progress, keeping it");
        protected.insert(target);
    }

    let entries = store.registry()?.newest_first();
    let doomed = plan(policy, &entries, &protected, Utc::now());

    let mut deleted = Vec::with_capacity(doomed.len());
    for id in doomed {
        match store.delete(&id) {
            Ok(()) => deleted.push(id),
            // Removed concurrently; nothing left to prune.
            Err(SnapError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    if deleted.is_empty() {
        return Ok(PruneReport {
            deleted,
            remaining: entries.len(),
        });
    }

    let remaining = store.registry()?.len();
    info!("retention removed {} snapshot(s), {remaining} remain", deleted.len());
    if remaining > policy.max_count {
        warn!(
            "{remaining} snapshots remain above max_count {} (protected entries)",
            policy.max_count
        );
    }
    Ok(PruneReport { deleted, remaining })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotKind;

    fn entry(id: &str, age_days: i64, now: DateTime<Utc>) -> RegistryEntry {
        RegistryEntry {
            snapshot_id: id.to_string(),
            created_at: now - Duration::days(age_days) - Duration::minutes(1),
            kind: SnapshotKind::Manual,
        }
    }

    fn policy(max_age_days: u32, max_count: usize) -> RetentionPolicy {
        RetentionPolicy {
            max_age_days,
            max_count,
        }
    }

    #[test]
    fn age_policy_removes_old_snapshots() {
        let now = Utc::now();
        let entries = vec![entry("new", 0, now), entry("week", 8, now), entry("month", 30, now)];
        let doomed = plan(&policy(7, 10), &entries, &HashSet::new(), now);
        assert_eq!(doomed, vec!["month".to_string(), "week".to_string()]);
    }

    #[test]
    fn count_policy_removes_oldest_excess() {
        let now = Utc::now();
        let entries: Vec<RegistryEntry> = (0..5)
            .map(|i| entry(&format!("s{i}"), 0, now - Duration::hours(i)))
            .collect();
        let doomed = plan(&policy(7, 3), &entries, &HashSet::new(), now);
        assert_eq!(doomed, vec!["s4".to_string(), "s3".to_string()]);
    }

    #[test]
    fn newest_snapshot_survives_even_when_over_age() {
        let now = Utc::now();
        let entries = vec![entry("ancient", 100, now), entry("older", 200, now)];
        let doomed = plan(&policy(7, 10), &entries, &HashSet::new(), now);
        assert_eq!(doomed, vec!["older".to_string()]);
    }

    #[test]
    fn protected_ids_are_never_planned() {
        let now = Utc::now();
        let entries: Vec<RegistryEntry> =
            (0..4).map(|i| entry(&format!("s{i}"), i * 10, now)).collect();
        let protected: HashSet<String> = ["s3".to_string()].into_iter().collect();
        let doomed = plan(&policy(7, 1), &entries, &protected, now);
        assert_eq!(doomed, vec!["s2".to_string(), "s1".to_string()]);
    }

    #[test]
    fn bounds_hold_for_default_policy() {
        let now = Utc::now();
        let entries: Vec<RegistryEntry> = (0..25)
            .map(|i| entry(&format!("s{i:02}"), 0, now - Duration::hours(i * 9)))
            .collect();
        let policy = policy(7, 10);
        let doomed: HashSet<String> =
            plan(&policy, &entries, &HashSet::new(), now).into_iter().collect();

        let survivors: Vec<&RegistryEntry> = entries
            .iter()
            .filter(|e| !doomed.contains(&e.snapshot_id))
            .collect();
        assert!(survivors.len() <= 10);
        let cutoff = now - Duration::days(7);
        assert!(survivors.iter().all(|e| e.created_at >= cutoff));
    }
}
