use tracing::{debug, info};

use crate::errors::{SnapError, SnapResult};
use crate::snapshot::Snapshot;
use crate::store::SnapshotStore;

/// Newest snapshot whose persisted `verified` flag is set.
///
/// The flag is trusted as stored; callers wanting fresh guarantees re-verify.
pub fn select_target(store: &SnapshotStore) -> SnapResult<Snapshot> {
    for entry in store.registry()?.newest_first() {
        match store.get(&entry.snapshot_id) {
            Ok(snapshot) if snapshot.integrity.verified => {
                info!("emergency target selected: {}", snapshot.id);
                return Ok(snapshot);
            }
            Ok(snapshot) => debug!("skipping unverified snapshot {}", snapshot.id),
            Err(e) => debug!("skipping snapshot {}: {e}", entry.snapshot_id),
        }
    }
    Err(SnapError::NoVerifiedSnapshot)
}
