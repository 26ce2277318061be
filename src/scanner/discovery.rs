use anyhow::anyhow;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use walkdir::WalkDir;

use super::{Asset, AssetPage, AssetSource};
use crate::error::{PipelineError, Result};

/// Recursively list image files under `directory`, sorted by path.
pub fn discover_images(directory: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !directory.is_dir() {
        return Err(PipelineError::PermissionDenied(format!(
            "{} is not a readable directory",
            directory.display()
        )));
    }
    std::fs::read_dir(directory).map_err(|e| {
        PipelineError::PermissionDenied(format!("{}: {}", directory.display(), e))
    })?;

    let mut images = Vec::new();

    for entry in WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        if path.is_file() && has_extension(path, extensions) {
            images.push(path.to_path_buf());
        }
    }

    images.sort();

    Ok(images)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.iter().any(|e| e.to_lowercase() == ext))
}

/// Stable id for a library file: `img_` plus the first 16 hex chars of the
/// SHA-256 of its canonical path.
pub fn asset_id(path: &Path) -> String {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("img_{}", hex)
}

fn creation_time(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = std::fs::metadata(path).ok()?;
    let time = metadata.created().or_else(|_| metadata.modified()).ok()?;
    Some(DateTime::<Utc>::from(time))
}

/// Asset source over local library directories.
///
/// The listing is taken when a scan starts (`after == None`) and served from
/// memory for the following pages, so cursors stay consistent within a pass.
pub struct FsAssetSource {
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
    listing: Mutex<Vec<Asset>>,
}

impl FsAssetSource {
    pub fn new(roots: Vec<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            roots,
            extensions,
            listing: Mutex::new(Vec::new()),
        }
    }

    fn list(&self) -> Result<Vec<Asset>> {
        if self.roots.is_empty() {
            return Err(PipelineError::PermissionDenied(
                "no library directories configured".to_string(),
            ));
        }

        let mut assets = Vec::new();
        for root in &self.roots {
            for path in discover_images(root, &self.extensions)? {
                let Some(created_at) = creation_time(&path) else {
                    tracing::debug!(path = %path.display(), "Skipping file without timestamps");
                    continue;
                };
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                assets.push(Asset {
                    id: asset_id(&path),
                    source_ref: path.to_string_lossy().to_string(),
                    file_name,
                    created_at,
                });
            }
        }

        // Newest first; path breaks ties so paging is deterministic.
        assets.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.source_ref.cmp(&b.source_ref))
        });
        assets.dedup_by(|a, b| a.id == b.id);

        Ok(assets)
    }
}

impl AssetSource for FsAssetSource {
    fn fetch_page(&self, after: Option<&str>, limit: usize) -> Result<AssetPage> {
        let mut listing = self.listing.lock().unwrap_or_else(PoisonError::into_inner);

        let start = match after {
            None => {
                *listing = self.list()?;
                0
            }
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| anyhow!("Invalid asset cursor '{}'", cursor))?,
        };

        let start = start.min(listing.len());
        let end = start.saturating_add(limit).min(listing.len());

        Ok(AssetPage {
            assets: listing[start..end].to_vec(),
            end_cursor: Some(end.to_string()),
            has_next_page: end < listing.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::scan_for_new;
    use std::fs::{self, File};
    use tempfile::tempdir;

    fn exts() -> Vec<String> {
        vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
    }

    #[test]
    fn test_discover_images() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();

        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();

        let images = discover_images(dir.path(), &exts()).unwrap();
        assert_eq!(images.len(), 3);
    }

    #[test]
    fn test_missing_root_is_permission_denied() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            discover_images(&missing, &exts()),
            Err(PipelineError::PermissionDenied(_))
        ));

        let source = FsAssetSource::new(vec![missing], exts());
        assert!(matches!(source.fetch_page(None, 10), Err(PipelineError::PermissionDenied(_))));
    }

    #[test]
    fn test_ids_are_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        File::create(&path).unwrap();

        let id = asset_id(&path);
        assert!(id.starts_with("img_"));
        assert_eq!(id.len(), 4 + 16);
        assert_eq!(id, asset_id(&path));
        assert_ne!(id, asset_id(&dir.path().join("b.jpg")));
    }

    #[test]
    fn test_pages_cover_listing() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            File::create(dir.path().join(format!("{}.jpg", i))).unwrap();
        }
        let source = FsAssetSource::new(vec![dir.path().to_path_buf()], exts());

        let first = source.fetch_page(None, 2).unwrap();
        assert_eq!(first.assets.len(), 2);
        assert!(first.has_next_page);

        let second = source.fetch_page(first.end_cursor.as_deref(), 10).unwrap();
        assert_eq!(second.assets.len(), 3);
        assert!(!second.has_next_page);

        let mut ids: Vec<_> = first
            .assets
            .iter()
            .chain(&second.assets)
            .map(|a| a.id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn test_scan_over_directory() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("only.jpg")).unwrap();
        let source = FsAssetSource::new(vec![dir.path().to_path_buf()], exts());

        let found = scan_for_new(&source, &[], 50, 20).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_name, "only.jpg");

        assert!(scan_for_new(&source, &found, 50, 20).unwrap().is_empty());
    }
}
