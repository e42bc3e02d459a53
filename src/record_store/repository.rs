//! Record Store repository
//!
//! ## 概要
//! 検出レコード・ヘルスログ・送信カーソルのDB操作 (SQLite)
//!
//! `sent` は単一ライター (Dispatcher) のみが false → true へ遷移させる。
//! 逆方向はオペレーター操作の `reset_sent` のみ。

use super::schema;
use super::types::{
    format_ts, parse_ts, CheckStatus, DetectionInsert, DetectionRecord, HealthCheckInsert,
    HealthCheckLogEntry, HealthComponent, LogFilter, LogPage, StreamKind,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Upper bound for a single log page
pub const MAX_PAGE_LIMIT: u32 = 500;

/// Shared record store
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect (creating the database file if missing) and bootstrap the schema
    pub async fn open(database_url: &str) -> Result<Self> {
        if let Some(path) = sqlite_file_path(database_url) {
            if let Some(parent) = Path::new(&path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.ensure_schema().await?;

        tracing::info!(database_url = %database_url, "Record store opened");
        Ok(store)
    }

    /// Create missing tables and indexes
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Trivial round trip; returns the observed latency
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        if one != 1 {
            return Err(Error::Internal(format!("unexpected ping result {}", one)));
        }
        Ok(started.elapsed())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============================================================
    // Detection Records
    // ============================================================

    /// Insert a detection row (inference pipeline side)
    pub async fn insert_detection(&self, insert: &DetectionInsert) -> Result<i64> {
        let created_at = insert.created_at.unwrap_or_else(Utc::now);
        let plate_texts = serde_json::to_string(&insert.plate_texts)?;
        let detections = serde_json::to_string(&insert.detections)?;

        let result = sqlx::query(
            r#"
            INSERT INTO detection_records (
                device_id, checkpoint_id, created_at,
                vehicle_count, plate_count, plate_texts, detections,
                annotated_image_path, processing_ms, sent, sent_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL)
            "#,
        )
        .bind(&insert.device_id)
        .bind(&insert.checkpoint_id)
        .bind(format_ts(&created_at))
        .bind(insert.vehicle_count)
        .bind(insert.plate_texts.len() as i32)
        .bind(plate_texts)
        .bind(detections)
        .bind(&insert.annotated_image_path)
        .bind(insert.processing_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_detection(&self, id: i64) -> Result<Option<DetectionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, device_id, checkpoint_id, created_at, vehicle_count, plate_count,
                   plate_texts, detections, annotated_image_path, processing_ms, sent, sent_at
            FROM detection_records
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.row_to_detection(&r)).transpose()
    }

    /// Unsent records, oldest first
    pub async fn fetch_unsent(&self, limit: u32) -> Result<Vec<DetectionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, checkpoint_id, created_at, vehicle_count, plate_count,
                   plate_texts, detections, annotated_image_path, processing_ms, sent, sent_at
            FROM detection_records
            WHERE sent = 0
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| self.row_to_detection(r)).collect()
    }

    /// Unsent records oldest first, leaving out `excluded` ids
    pub async fn fetch_unsent_excluding(
        &self,
        excluded: &[i64],
        limit: u32,
    ) -> Result<Vec<DetectionRecord>> {
        if excluded.is_empty() {
            return self.fetch_unsent(limit).await;
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT id, device_id, checkpoint_id, created_at, vehicle_count, plate_count,
                   plate_texts, detections, annotated_image_path, processing_ms, sent, sent_at
            FROM detection_records
            WHERE sent = 0 AND id NOT IN ("#,
        );
        let mut separated = qb.separated(", ");
        for id in excluded {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        qb.push(" ORDER BY created_at ASC, id ASC LIMIT ")
            .push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(|r| self.row_to_detection(r)).collect()
    }

    /// Unsent records with id > `after_id`, in id order (a high-water walk)
    pub async fn fetch_unsent_after(&self, after_id: i64, limit: u32) -> Result<Vec<DetectionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, checkpoint_id, created_at, vehicle_count, plate_count,
                   plate_texts, detections, annotated_image_path, processing_ms, sent, sent_at
            FROM detection_records
            WHERE sent = 0 AND id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| self.row_to_detection(r)).collect()
    }

    /// sent=false → true. Returns false when the row was already sent or missing.
    pub async fn mark_sent(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE detection_records SET sent = 1, sent_at = ? WHERE id = ? AND sent = 0",
        )
        .bind(format_ts(&at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Operator-triggered resend: sent=true → false
    pub async fn reset_sent(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE detection_records SET sent = 0, sent_at = NULL WHERE id = ? AND sent = 1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn count_unsent(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM detection_records WHERE sent = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_sent(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM detection_records WHERE sent = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Image paths referenced by at least one unsent record, as stored.
    ///
    /// The storage monitor treats every other capture file as sent, so a path
    /// shared by several records stays protected until all of them are sent.
    pub async fn unsent_image_paths(&self) -> Result<Vec<String>> {
        let paths: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT annotated_image_path FROM detection_records
            WHERE sent = 0 AND annotated_image_path IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    fn row_to_detection(&self, row: &SqliteRow) -> Result<DetectionRecord> {
        let created_raw: String = row.try_get("created_at")?;
        let created_at = parse_ts(&created_raw)
            .ok_or_else(|| Error::Internal(format!("bad created_at '{}'", created_raw)))?;
        let sent_at = row
            .try_get::<Option<String>, _>("sent_at")?
            .and_then(|raw| parse_ts(&raw));

        let plate_texts: String = row.try_get("plate_texts")?;
        let detections: String = row.try_get("detections")?;

        Ok(DetectionRecord {
            id: row.try_get("id")?,
            device_id: row.try_get("device_id")?,
            checkpoint_id: row.try_get("checkpoint_id")?,
            created_at,
            vehicle_count: row.try_get("vehicle_count")?,
            plate_count: row.try_get("plate_count")?,
            plate_texts: serde_json::from_str(&plate_texts)?,
            detections: serde_json::from_str(&detections)?,
            annotated_image_path: row.try_get("annotated_image_path")?,
            processing_ms: row.try_get("processing_ms")?,
            sent: row.try_get("sent")?,
            sent_at,
        })
    }

    // ============================================================
    // Health Check Logs (append-only)
    // ============================================================

    /// The single logging primitive for health results
    pub async fn insert_health_log(&self, insert: &HealthCheckInsert) -> Result<i64> {
        let details = insert
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO health_check_logs (timestamp, component, status, message, details)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(format_ts(&insert.timestamp))
        .bind(insert.component.as_str())
        .bind(insert.status.as_str())
        .bind(&insert.message)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Paginated listing, newest first. `page` starts at 1.
    pub async fn list_health_logs(&self, filter: &LogFilter, limit: u32, page: u32) -> Result<LogPage> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let page = page.max(1);
        let offset = (page as i64 - 1) * limit as i64;

        let mut count_qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM health_check_logs");
        push_log_filter(&mut count_qb, filter);
        let total: i64 = count_qb.build().fetch_one(&self.pool).await?.try_get("total")?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, timestamp, component, status, message, details FROM health_check_logs",
        );
        push_log_filter(&mut qb, filter);
        qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(|r| self.row_to_health_log(r))
            .collect::<Result<Vec<_>>>()?;

        Ok(LogPage {
            items,
            total,
            page,
            limit,
        })
    }

    /// Entries with id > cursor, oldest first
    pub async fn health_logs_after(&self, cursor: i64, limit: u32) -> Result<Vec<HealthCheckLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, component, status, message, details
            FROM health_check_logs
            WHERE id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(cursor)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| self.row_to_health_log(r)).collect()
    }

    fn row_to_health_log(&self, row: &SqliteRow) -> Result<HealthCheckLogEntry> {
        let ts_raw: String = row.try_get("timestamp")?;
        let timestamp =
            parse_ts(&ts_raw).ok_or_else(|| Error::Internal(format!("bad timestamp '{}'", ts_raw)))?;
        let component: String = row.try_get("component")?;
        let status: String = row.try_get("status")?;
        let details = row
            .try_get::<Option<String>, _>("details")?
            .map(|s| serde_json::from_str(&s))
            .transpose()?;

        Ok(HealthCheckLogEntry {
            id: row.try_get("id")?,
            timestamp,
            component: HealthComponent::from(component.as_str()),
            status: CheckStatus::from(status.as_str()),
            message: row.try_get("message")?,
            details,
        })
    }

    // ============================================================
    // Dispatch Cursors
    // ============================================================

    pub async fn get_cursor(&self, stream: StreamKind) -> Result<i64> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT last_id FROM dispatch_cursors WHERE data_type = ?")
                .bind(stream.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(last.unwrap_or(0))
    }

    /// Monotonic: a lower id never moves the cursor back
    pub async fn advance_cursor(&self, stream: StreamKind, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_cursors (data_type, last_id, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(data_type) DO UPDATE SET
                last_id = MAX(last_id, excluded.last_id),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(stream.as_str())
        .bind(id)
        .bind(format_ts(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn push_log_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &LogFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(component) = &filter.component {
        qb.push(" AND component = ")
            .push_bind(HealthComponent::from(component.as_str()).as_str().to_string());
    }
    if let Some(status) = &filter.status {
        qb.push(" AND status = ")
            .push_bind(status.as_str());
    }
    if let Some(since) = &filter.since {
        qb.push(" AND timestamp >= ").push_bind(format_ts(since));
    }
    if let Some(until) = &filter.until {
        qb.push(" AND timestamp <= ").push_bind(format_ts(until));
    }
}

/// Filesystem path of a file-backed SQLite URL
fn sqlite_file_path(url: &str) -> Option<String> {
    let rest = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::types::PlateText;
    use chrono::TimeZone;

    async fn temp_store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("records.db").display());
        let store = RecordStore::open(&url).await.unwrap();
        (dir, store)
    }

    fn detection_at(secs: i64) -> DetectionInsert {
        DetectionInsert {
            device_id: "edge-1".into(),
            checkpoint_id: "cp-1".into(),
            created_at: Some(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()),
            vehicle_count: 1,
            plate_texts: vec![PlateText {
                text: "ABC123".into(),
                confidence: 0.91,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_sqlite_file_path() {
        assert_eq!(
            sqlite_file_path("sqlite:///var/lib/x/records.db?mode=rwc").as_deref(),
            Some("/var/lib/x/records.db")
        );
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("postgres://x"), None);
    }

    #[tokio::test]
    async fn test_fetch_unsent_is_oldest_first() {
        let (_dir, store) = temp_store().await;
        // inserted out of chronological order
        let newer = store.insert_detection(&detection_at(20)).await.unwrap();
        let older = store.insert_detection(&detection_at(10)).await.unwrap();

        let unsent = store.fetch_unsent(10).await.unwrap();
        let ids: Vec<i64> = unsent.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![older, newer]);
        assert_eq!(unsent[0].plate_count, 1);
        assert_eq!(unsent[0].plate_texts[0].text, "ABC123");
    }

    #[tokio::test]
    async fn test_fetch_unsent_excluding_skips_held_ids() {
        let (_dir, store) = temp_store().await;
        let a = store.insert_detection(&detection_at(10)).await.unwrap();
        let b = store.insert_detection(&detection_at(20)).await.unwrap();
        let c = store.insert_detection(&detection_at(30)).await.unwrap();

        let ids = |rs: Vec<DetectionRecord>| rs.iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids(store.fetch_unsent_excluding(&[a, b], 2).await.unwrap()), vec![c]);
        assert_eq!(ids(store.fetch_unsent_excluding(&[], 2).await.unwrap()), vec![a, b]);
    }

    #[tokio::test]
    async fn test_fetch_unsent_after_walks_by_id() {
        let (_dir, store) = temp_store().await;
        // lower id, later creation time
        let first = store.insert_detection(&detection_at(20)).await.unwrap();
        let second = store.insert_detection(&detection_at(10)).await.unwrap();

        let batch = store.fetch_unsent_after(0, 1).await.unwrap();
        assert_eq!(batch[0].id, first);
        let batch = store.fetch_unsent_after(first, 1).await.unwrap();
        assert_eq!(batch[0].id, second);
        assert!(store.fetch_unsent_after(second, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_sent_is_one_way() {
        let (_dir, store) = temp_store().await;
        let id = store.insert_detection(&detection_at(0)).await.unwrap();

        assert!(store.mark_sent(id, Utc::now()).await.unwrap());
        // second transition is a no-op
        assert!(!store.mark_sent(id, Utc::now()).await.unwrap());

        let record = store.get_detection(id).await.unwrap().unwrap();
        assert!(record.sent);
        assert!(record.sent_at.is_some());
        assert!(store.fetch_unsent(10).await.unwrap().is_empty());

        assert!(store.reset_sent(id).await.unwrap());
        let record = store.get_detection(id).await.unwrap().unwrap();
        assert!(!record.sent);
        assert!(record.sent_at.is_none());
    }

    #[tokio::test]
    async fn test_unsent_image_paths() {
        let (_dir, store) = temp_store().await;
        let mut a = detection_at(0);
        a.annotated_image_path = Some("/captures/a.jpg".into());
        let mut b = detection_at(1);
        b.annotated_image_path = Some("/captures/b.jpg".into());
        let mut shared = detection_at(2);
        shared.annotated_image_path = Some("/captures/b.jpg".into());
        let a_id = store.insert_detection(&a).await.unwrap();
        let b_id = store.insert_detection(&b).await.unwrap();
        store.insert_detection(&shared).await.unwrap();
        store.insert_detection(&detection_at(3)).await.unwrap();
        store.mark_sent(a_id, Utc::now()).await.unwrap();
        store.mark_sent(b_id, Utc::now()).await.unwrap();

        // b.jpg still has one unsent record
        let paths = store.unsent_image_paths().await.unwrap();
        assert_eq!(paths, vec!["/captures/b.jpg".to_string()]);
    }

    #[tokio::test]
    async fn test_health_logs_pagination_and_filter() {
        let (_dir, store) = temp_store().await;
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        for i in 0..5 {
            store
                .insert_health_log(&HealthCheckInsert {
                    timestamp: base + chrono::Duration::seconds(i),
                    component: if i % 2 == 0 {
                        HealthComponent::Disk
                    } else {
                        HealthComponent::Camera
                    },
                    status: if i == 4 { CheckStatus::Fail } else { CheckStatus::Pass },
                    message: format!("check {}", i),
                    details: Some(serde_json::json!({ "i": i })),
                })
                .await
                .unwrap();
        }

        let page = store
            .list_health_logs(&LogFilter::default(), 2, 1)
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].message, "check 4");
        assert_eq!(page.total_pages(), 3);

        let last = store
            .list_health_logs(&LogFilter::default(), 2, 3)
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].message, "check 0");

        let disk_fail = store
            .list_health_logs(
                &LogFilter {
                    component: Some("disk".into()),
                    status: Some(CheckStatus::Fail),
                    ..Default::default()
                },
                10,
                1,
            )
            .await
            .unwrap();
        assert_eq!(disk_fail.total, 1);
        assert_eq!(disk_fail.items[0].details, Some(serde_json::json!({ "i": 4 })));
    }

    #[tokio::test]
    async fn test_cursor_never_moves_back() {
        let (_dir, store) = temp_store().await;
        assert_eq!(store.get_cursor(StreamKind::Health).await.unwrap(), 0);
        store.advance_cursor(StreamKind::Health, 7).await.unwrap();
        store.advance_cursor(StreamKind::Health, 3).await.unwrap();
        assert_eq!(store.get_cursor(StreamKind::Health).await.unwrap(), 7);
        assert_eq!(store.get_cursor(StreamKind::Detection).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ping() {
        let (_dir, store) = temp_store().await;
        assert!(store.ping().await.is_ok());
        store.close().await;
        assert!(store.ping().await.is_err());
    }
}
