pub const SCHEMA: &str = r#"
-- Images table: one row per known image and its captioning state
CREATE TABLE IF NOT EXISTS images (
    id TEXT PRIMARY KEY,
    position INTEGER NOT NULL,
    source_ref TEXT NOT NULL,
    file_name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'unprocessed',

    -- Generated content
    caption TEXT,
    detailed_caption TEXT,
    error TEXT,

    -- Lifecycle timestamps (RFC 3339)
    processing_started_at TEXT,
    processing_completed_at TEXT,
    created_at TEXT NOT NULL,
    captured_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_images_status ON images(status);
CREATE INDEX IF NOT EXISTS idx_images_source_ref ON images(source_ref);

-- Processing queue, FIFO by position
CREATE TABLE IF NOT EXISTS queue (
    position INTEGER PRIMARY KEY,
    image_id TEXT NOT NULL UNIQUE
);

-- Small key/value blobs: settings JSON, last scan time
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Store-wide drain lease; at most one row
CREATE TABLE IF NOT EXISTS drain_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    owner TEXT NOT NULL,
    renewed_at TEXT NOT NULL
);
"#;
