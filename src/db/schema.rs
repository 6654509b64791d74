pub const SCHEMA: &str = r#"
-- Photos table: one row per discovered image file
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    filename TEXT NOT NULL,
    directory TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    modified_at TEXT,
    imported_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,

    -- Image metadata
    width INTEGER,
    height INTEGER,

    -- EXIF data
    camera_make TEXT,
    camera_model TEXT,
    captured_at TEXT,
    gps_latitude REAL,
    gps_longitude REAL,

    -- Pipeline state: 0 = unprocessed, 1 = basic, 2 = full
    stage INTEGER NOT NULL DEFAULT 0,
    decode_error TEXT,
    -- Stages that failed on the last analysis, one per line
    analysis_error TEXT,
    analyzed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_photos_directory ON photos(directory);
CREATE INDEX IF NOT EXISTS idx_photos_stage ON photos(stage);
CREATE INDEX IF NOT EXISTS idx_photos_captured_at ON photos(captured_at);

-- Persons: cluster identities, optionally named by the user
CREATE TABLE IF NOT EXISTS persons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Faces: detections in original-pixel coordinates
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
    bbox_x INTEGER NOT NULL,
    bbox_y INTEGER NOT NULL,
    bbox_w INTEGER NOT NULL,
    bbox_h INTEGER NOT NULL,
    confidence REAL NOT NULL,
    embedding BLOB,
    embedding_dim INTEGER,
    person_id INTEGER REFERENCES persons(id) ON DELETE SET NULL,
    -- 'cluster' when set by clustering, 'user' when set by a merge or manual assign
    assignment TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_faces_person ON faces(person_id);

-- Objects: namespaced category labels (group:detail)
CREATE TABLE IF NOT EXISTS objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
    category TEXT NOT NULL,
    confidence REAL NOT NULL,
    bbox_x INTEGER NOT NULL,
    bbox_y INTEGER NOT NULL,
    bbox_w INTEGER NOT NULL,
    bbox_h INTEGER NOT NULL,
    -- Crop embedding for animals, feeds the pet index
    embedding BLOB,
    embedding_dim INTEGER
);

CREATE INDEX IF NOT EXISTS idx_objects_photo ON objects(photo_id);
CREATE INDEX IF NOT EXISTS idx_objects_category ON objects(category);

-- Scenes: classifier labels and zero-shot tags
CREATE TABLE IF NOT EXISTS scenes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
    label TEXT NOT NULL,
    confidence REAL NOT NULL,
    source TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scenes_photo ON scenes(photo_id);
CREATE INDEX IF NOT EXISTS idx_scenes_label ON scenes(label);

CREATE TABLE IF NOT EXISTS captions (
    photo_id INTEGER PRIMARY KEY REFERENCES photos(id) ON DELETE CASCADE,
    text TEXT NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Whole-image embeddings, feed the image index
CREATE TABLE IF NOT EXISTS image_embeddings (
    photo_id INTEGER PRIMARY KEY REFERENCES photos(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    embedding_dim INTEGER NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- User tags, never written by the pipeline
CREATE TABLE IF NOT EXISTS tags (
    photo_id INTEGER NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (photo_id, tag)
);

CREATE INDEX IF NOT EXISTS idx_tags_tag ON tags(tag);

-- Reverse-geocoded places
CREATE TABLE IF NOT EXISTS places (
    photo_id INTEGER PRIMARY KEY REFERENCES photos(id) ON DELETE CASCADE,
    city TEXT,
    region TEXT,
    country TEXT,
    resolved INTEGER NOT NULL DEFAULT 0,
    geocoded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Scan job history for polling clients
CREATE TABLE IF NOT EXISTS scan_jobs (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    folder TEXT,
    status TEXT NOT NULL,
    phase TEXT NOT NULL,
    progress REAL NOT NULL DEFAULT 0,
    message TEXT NOT NULL DEFAULT '',
    total INTEGER NOT NULL DEFAULT 0,
    processed INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    finished_at TEXT
);
"#;

/// Additive migrations for databases created by earlier versions.
/// Each statement may fail harmlessly when already applied.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE photos ADD COLUMN analyzed_at TEXT",
    "ALTER TABLE faces ADD COLUMN assignment TEXT",
    "ALTER TABLE objects ADD COLUMN embedding BLOB",
    "ALTER TABLE objects ADD COLUMN embedding_dim INTEGER",
    "ALTER TABLE photos ADD COLUMN analysis_error TEXT",
];
