//! SQLite backend implementation.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::schema::SCHEMA;
use super::{lease_is_live, Collections, PersistentStore};
use crate::pipeline::{ImageRecord, ImageStatus};
use crate::settings::Settings;

const SETTINGS_KEY: &str = "settings";
const LAST_SCAN_KEY: &str = "last_scan_at";
/// How long a writer waits for another process to finish its transaction.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_kv(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

fn to_text(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

fn parse_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| anyhow!("Invalid timestamp '{}': {}", s, e))
        })
        .transpose()
}

/// Raw row; timestamps are parsed after the query so parse errors keep
/// their message instead of becoming a rusqlite conversion error.
struct ImageRow {
    id: String,
    source_ref: String,
    file_name: String,
    status: String,
    caption: Option<String>,
    detailed_caption: Option<String>,
    error: Option<String>,
    processing_started_at: Option<String>,
    processing_completed_at: Option<String>,
    created_at: String,
    captured_at: Option<String>,
}

fn row_to_image(row: &Row) -> rusqlite::Result<ImageRow> {
    Ok(ImageRow {
        id: row.get(0)?,
        source_ref: row.get(1)?,
        file_name: row.get(2)?,
        status: row.get(3)?,
        caption: row.get(4)?,
        detailed_caption: row.get(5)?,
        error: row.get(6)?,
        processing_started_at: row.get(7)?,
        processing_completed_at: row.get(8)?,
        created_at: row.get(9)?,
        captured_at: row.get(10)?,
    })
}

impl TryFrom<ImageRow> for ImageRecord {
    type Error = anyhow::Error;

    fn try_from(row: ImageRow) -> Result<Self> {
        let status = ImageStatus::from_str(&row.status)
            .ok_or_else(|| anyhow!("Unknown status '{}' for image {}", row.status, row.id))?;
        let created_at = parse_ts(Some(row.created_at))?
            .ok_or_else(|| anyhow!("Missing created_at for image {}", row.id))?;

        Ok(ImageRecord {
            id: row.id,
            source_ref: row.source_ref,
            file_name: row.file_name,
            status,
            caption: row.caption,
            detailed_caption: row.detailed_caption,
            error: row.error,
            processing_started_at: parse_ts(row.processing_started_at)?,
            processing_completed_at: parse_ts(row.processing_completed_at)?,
            created_at,
            captured_at: parse_ts(row.captured_at)?,
        })
    }
}

const SELECT_IMAGES: &str = r#"
    SELECT id, source_ref, file_name, status,
           caption, detailed_caption, error,
           processing_started_at, processing_completed_at,
           created_at, captured_at
    FROM images
    ORDER BY position ASC
"#;

const INSERT_IMAGE: &str = r#"
    INSERT INTO images (
        id, position, source_ref, file_name, status,
        caption, detailed_caption, error,
        processing_started_at, processing_completed_at,
        created_at, captured_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

fn read_images(conn: &Connection) -> Result<Vec<ImageRecord>> {
    let mut stmt = conn.prepare(SELECT_IMAGES)?;
    let rows = stmt
        .query_map([], row_to_image)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter().map(ImageRecord::try_from).collect()
}

fn write_images(conn: &Connection, images: &[ImageRecord]) -> Result<()> {
    conn.execute("DELETE FROM images", [])?;
    let mut stmt = conn.prepare(INSERT_IMAGE)?;
    for (position, image) in images.iter().enumerate() {
        stmt.execute(params![
            image.id,
            position as i64,
            image.source_ref,
            image.file_name,
            image.status.as_str(),
            image.caption,
            image.detailed_caption,
            image.error,
            to_text(image.processing_started_at),
            to_text(image.processing_completed_at),
            image.created_at.to_rfc3339(),
            to_text(image.captured_at),
        ])?;
    }
    Ok(())
}

fn read_queue(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT image_id FROM queue ORDER BY position ASC")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

fn write_queue(conn: &Connection, ids: &[String]) -> Result<()> {
    conn.execute("DELETE FROM queue", [])?;
    let mut stmt =
        conn.prepare("INSERT OR IGNORE INTO queue (position, image_id) VALUES (?, ?)")?;
    for (position, id) in ids.iter().enumerate() {
        stmt.execute(params![position as i64, id])?;
    }
    Ok(())
}

impl PersistentStore for SqliteStore {
    fn load_images(&self) -> Result<Vec<ImageRecord>> {
        read_images(&self.conn())
    }

    fn save_images(&self, images: &[ImageRecord]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        write_images(&tx, images)?;
        tx.commit()?;
        Ok(())
    }

    fn load_settings(&self) -> Result<Settings> {
        match self.get_kv(SETTINGS_KEY)? {
            Some(json) => serde_json::from_str(&json).context("Failed to parse stored settings"),
            None => Ok(Settings::default()),
        }
    }

    fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.set_kv(SETTINGS_KEY, &serde_json::to_string(settings)?)
    }

    fn load_queue(&self) -> Result<Vec<String>> {
        read_queue(&self.conn())
    }

    fn save_queue(&self, ids: &[String]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        write_queue(&tx, ids)?;
        tx.commit()?;
        Ok(())
    }

    fn load_last_scan_at(&self) -> Result<Option<DateTime<Utc>>> {
        parse_ts(self.get_kv(LAST_SCAN_KEY)?)
    }

    fn save_last_scan_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_kv(LAST_SCAN_KEY, &at.to_rfc3339())
    }

    fn update(&self, apply: &mut dyn FnMut(&mut Collections) -> Result<bool>) -> Result<()> {
        let mut conn = self.conn();
        // IMMEDIATE takes the write lock up front, so a second process blocks
        // here instead of reading a snapshot it cannot commit over.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut data = Collections {
            images: read_images(&tx)?,
            queue: read_queue(&tx)?,
        };
        if apply(&mut data)? {
            write_images(&tx, &data.images)?;
            write_queue(&tx, &data.queue)?;
            tx.commit()?;
        }
        Ok(())
    }

    fn acquire_drain_lease(&self, owner: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let holder: Option<(String, String)> = tx
            .query_row("SELECT owner, renewed_at FROM drain_lease WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        if let Some((holder, renewed_at)) = holder {
            if holder != owner {
                let renewed_at = parse_ts(Some(renewed_at))?;
                if renewed_at.is_some_and(|at| lease_is_live(at, now)) {
                    return Ok(false);
                }
                tracing::warn!(previous = %holder, "Taking over abandoned drain lease");
            }
        }

        tx.execute(
            "INSERT INTO drain_lease (id, owner, renewed_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE
             SET owner = excluded.owner, renewed_at = excluded.renewed_at",
            params![owner, now.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn release_drain_lease(&self, owner: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM drain_lease WHERE id = 1 AND owner = ?", [owner])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ScanFrequency;
    use tempfile::tempdir;

    #[test]
    fn test_images_survive_reopen_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memora.db");

        let mut processed = ImageRecord::new("b", "/p/b.jpg", "b.jpg");
        processed.begin_processing(Utc::now()).unwrap();
        processed.complete("A red kite", Utc::now()).unwrap();
        let images = vec![
            ImageRecord::new("a", "/p/a.jpg", "a.jpg").with_captured_at(Utc::now()),
            processed,
        ];

        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_images(&images).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load_images().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "a");
        assert!(loaded[0].captured_at.is_some());
        assert_eq!(loaded[1].status, ImageStatus::Processed);
        assert_eq!(loaded[1].caption.as_deref(), Some("A red kite"));
        assert_eq!(
            loaded[1].processing_started_at.map(|t| t.timestamp_millis()),
            images[1].processing_started_at.map(|t| t.timestamp_millis())
        );
    }

    #[test]
    fn test_save_images_replaces_collection() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .save_images(&[ImageRecord::new("a", "/a", "a"), ImageRecord::new("b", "/b", "b")])
            .unwrap();
        store.save_images(&[ImageRecord::new("c", "/c", "c")]).unwrap();

        let ids: Vec<_> = store.load_images().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn test_queue_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load_queue().unwrap().is_empty());

        let ids: Vec<String> = ["z", "a", "m"].iter().map(|s| s.to_string()).collect();
        store.save_queue(&ids).unwrap();
        assert_eq!(store.load_queue().unwrap(), ids);

        store.save_queue(&[]).unwrap();
        assert!(store.load_queue().unwrap().is_empty());
    }

    #[test]
    fn test_settings_and_last_scan() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.load_settings().unwrap(), Settings::default());
        assert!(store.load_last_scan_at().unwrap().is_none());

        let mut settings = Settings::default();
        settings.scan.auto_scan_enabled = true;
        settings.scan.frequency = ScanFrequency::Weekly;
        store.save_settings(&settings).unwrap();
        assert_eq!(store.load_settings().unwrap(), settings);

        let now = Utc::now();
        store.save_last_scan_at(now).unwrap();
        let loaded = store.load_last_scan_at().unwrap().unwrap();
        assert_eq!(loaded.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_update_writes_only_when_asked() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_queue(&["a".to_string()]).unwrap();

        store
            .update(&mut |data: &mut Collections| -> Result<bool> {
                data.queue.clear();
                Ok(false)
            })
            .unwrap();
        assert_eq!(store.load_queue().unwrap(), vec!["a"]);

        store
            .update(&mut |data: &mut Collections| -> Result<bool> {
                data.images.push(ImageRecord::new("b", "/p/b.jpg", "b.jpg"));
                data.queue.push("b".to_string());
                Ok(true)
            })
            .unwrap();
        assert_eq!(store.load_queue().unwrap(), vec!["a", "b"]);
        assert_eq!(store.load_images().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_update_leaves_store_untouched() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.update(&mut |data: &mut Collections| -> Result<bool> {
            data.queue.push("a".to_string());
            Err(anyhow!("rejected"))
        });
        assert!(result.is_err());
        assert!(store.load_queue().unwrap().is_empty());
    }

    #[test]
    fn test_drain_lease_is_exclusive_across_connections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memora.db");
        let cli = SqliteStore::open(&path).unwrap();
        let daemon = SqliteStore::open(&path).unwrap();
        let now = Utc::now();

        assert!(daemon.acquire_drain_lease("daemon", now).unwrap());
        assert!(!cli.acquire_drain_lease("cli", now).unwrap());
        // Renewal by the holder succeeds.
        assert!(daemon.acquire_drain_lease("daemon", now).unwrap());

        // Releasing someone else's lease is a no-op.
        cli.release_drain_lease("cli").unwrap();
        assert!(!cli.acquire_drain_lease("cli", now).unwrap());

        daemon.release_drain_lease("daemon").unwrap();
        assert!(cli.acquire_drain_lease("cli", now).unwrap());
    }

    #[test]
    fn test_abandoned_drain_lease_is_taken_over() {
        let store = SqliteStore::open_in_memory().unwrap();
        let then = Utc::now();
        let later = then + chrono::Duration::seconds(crate::db::DRAIN_LEASE_SECS);

        assert!(store.acquire_drain_lease("crashed", then).unwrap());
        assert!(store.acquire_drain_lease("fresh", later).unwrap());
        assert!(!store.acquire_drain_lease("crashed", later).unwrap());
    }
}
