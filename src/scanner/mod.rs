pub mod dedup;
pub mod discovery;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::pipeline::ImageRecord;

pub use dedup::{is_duplicate, DEDUP_TOLERANCE_MS};
pub use discovery::{discover_images, FsAssetSource};

/// One image as reported by an asset source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: String,
    pub source_ref: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    pub fn into_record(self) -> ImageRecord {
        ImageRecord::new(self.id, self.source_ref, self.file_name).with_captured_at(self.created_at)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssetPage {
    pub assets: Vec<Asset>,
    /// Opaque cursor for the next page; meaningful only to the source that issued it.
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

/// A paged, newest-first view of the device's media library.
pub trait AssetSource: Send + Sync {
    /// Fetch up to `limit` assets following `after`. `None` starts from the newest.
    fn fetch_page(&self, after: Option<&str>, limit: usize) -> Result<AssetPage>;
}

/// Collect up to `batch_size` assets not already represented in `existing`.
///
/// Pages through the source until enough new items are found or it runs dry.
/// Never touches the record store; the caller decides what to insert.
pub fn scan_for_new(
    source: &dyn AssetSource,
    existing: &[ImageRecord],
    batch_size: usize,
    page_size: usize,
) -> Result<Vec<ImageRecord>> {
    let mut accepted: Vec<ImageRecord> = Vec::new();
    let mut after: Option<String> = None;
    let mut pages = 0usize;

    while accepted.len() < batch_size {
        let page = source.fetch_page(after.as_deref(), page_size.max(1))?;
        pages += 1;

        for asset in page.assets {
            if is_duplicate(&asset, existing, &accepted) {
                continue;
            }
            accepted.push(asset.into_record());
            if accepted.len() >= batch_size {
                break;
            }
        }

        if !page.has_next_page {
            break;
        }
        // A source that claims more pages without a cursor would loop forever.
        match page.end_cursor {
            Some(cursor) if after.as_deref() != Some(cursor.as_str()) => after = Some(cursor),
            _ => {
                tracing::warn!(pages, "Asset source returned no usable cursor; stopping scan");
                break;
            }
        }
    }

    tracing::debug!(pages, new = accepted.len(), "Scan pass finished");
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    /// Serves a fixed list of assets in pages, counting calls.
    struct ListSource {
        assets: Vec<Asset>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ListSource {
        fn new(assets: Vec<Asset>) -> Self {
            Self {
                assets,
                calls: Default::default(),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl AssetSource for ListSource {
        fn fetch_page(&self, after: Option<&str>, limit: usize) -> Result<AssetPage> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let start: usize = after.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (start + limit).min(self.assets.len());
            Ok(AssetPage {
                assets: self.assets[start..end].to_vec(),
                end_cursor: Some(end.to_string()),
                has_next_page: end < self.assets.len(),
            })
        }
    }

    fn assets(n: usize) -> Vec<Asset> {
        let base = Utc::now();
        (0..n)
            .map(|i| Asset {
                id: format!("img_{}", i),
                source_ref: format!("/lib/{}.jpg", i),
                file_name: format!("{}.jpg", i),
                created_at: base - Duration::minutes(i as i64),
            })
            .collect()
    }

    #[test]
    fn test_stops_at_batch_size() {
        let source = ListSource::new(assets(45));
        let found = scan_for_new(&source, &[], 25, 20).unwrap();
        assert_eq!(found.len(), 25);
        assert_eq!(source.calls(), 2);
        assert_eq!(found[0].id, "img_0");
        assert!(found.iter().all(|r| r.captured_at.is_some()));
    }

    #[test]
    fn test_stops_when_pages_run_out() {
        let source = ListSource::new(assets(7));
        let found = scan_for_new(&source, &[], 50, 3).unwrap();
        assert_eq!(found.len(), 7);
        assert_eq!(source.calls(), 3);
    }

    #[test]
    fn test_second_scan_finds_nothing() {
        let source = ListSource::new(assets(12));
        let first = scan_for_new(&source, &[], 50, 5).unwrap();
        assert_eq!(first.len(), 12);

        let second = scan_for_new(&source, &first, 50, 5).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_skips_known_and_keeps_paging() {
        let all = assets(10);
        let existing: Vec<ImageRecord> = all[..4].iter().cloned().map(Asset::into_record).collect();
        let source = ListSource::new(all);

        let found = scan_for_new(&source, &existing, 3, 4).unwrap();
        let ids: Vec<_> = found.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["img_4", "img_5", "img_6"]);
    }

    #[test]
    fn test_burst_on_empty_library_keeps_every_shot() {
        let base = Utc::now();
        let burst: Vec<Asset> = (0..3)
            .map(|i| Asset {
                id: format!("burst_{}", i),
                source_ref: format!("/lib/burst_{}.jpg", i),
                file_name: format!("burst_{}.jpg", i),
                created_at: base - Duration::milliseconds(300 * i as i64),
            })
            .collect();
        let source = ListSource::new(burst);

        let first = scan_for_new(&source, &[], 50, 20).unwrap();
        assert_eq!(first.len(), 3);
        assert!(scan_for_new(&source, &first, 50, 20).unwrap().is_empty());
    }
}
