//! Schema bootstrap
//!
//! Idempotent DDL applied at startup. Production deployments manage the
//! schema with their own migration tooling; these statements only create
//! what is missing.

pub const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS detection_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        checkpoint_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        vehicle_count INTEGER NOT NULL DEFAULT 0,
        plate_count INTEGER NOT NULL DEFAULT 0,
        plate_texts TEXT NOT NULL DEFAULT '[]',
        detections TEXT NOT NULL DEFAULT '[]',
        annotated_image_path TEXT NULL,
        processing_ms INTEGER NULL,
        sent INTEGER NOT NULL DEFAULT 0,
        sent_at TEXT NULL,
        CHECK ((sent = 0 AND sent_at IS NULL) OR (sent = 1 AND sent_at IS NOT NULL))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_detection_unsent ON detection_records (sent, created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_detection_image ON detection_records (annotated_image_path)",
    r#"
    CREATE TABLE IF NOT EXISTS health_check_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        component TEXT NOT NULL,
        status TEXT NOT NULL,
        message TEXT NOT NULL,
        details TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_health_logs_ts ON health_check_logs (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_health_logs_component ON health_check_logs (component, status)",
    r#"
    CREATE TABLE IF NOT EXISTS dispatch_cursors (
        data_type TEXT PRIMARY KEY,
        last_id INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];
