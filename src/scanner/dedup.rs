//! Duplicate detection for scan candidates.
//!
//! Library assets carry no content hash, so a candidate is matched against
//! known records by identity, location, or a creation time close enough to be
//! the same shot.

use super::Asset;
use crate::pipeline::ImageRecord;

/// Two creation times closer than this many milliseconds are the same image.
pub const DEDUP_TOLERANCE_MS: i64 = 1_000;

fn same_identity(asset: &Asset, record: &ImageRecord) -> bool {
    record.id == asset.id || record.source_ref == asset.source_ref
}

fn matches(asset: &Asset, record: &ImageRecord) -> bool {
    if same_identity(asset, record) {
        return true;
    }
    let delta = (record.reference_time() - asset.created_at).num_milliseconds();
    delta.abs() < DEDUP_TOLERANCE_MS
}

/// True if `asset` is already represented in `existing`.
///
/// Candidates accepted earlier in the same pass only count when they are the
/// same asset; burst shots taken within the tolerance are all kept.
pub fn is_duplicate(asset: &Asset, existing: &[ImageRecord], accepted: &[ImageRecord]) -> bool {
    existing.iter().any(|record| matches(asset, record))
        || accepted.iter().any(|record| same_identity(asset, record))
}
