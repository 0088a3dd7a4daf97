//! Append-only round history in SQLite.
//!
//! Schema:
//! - `check_rounds`: one row per round (timestamp, round score, max score)
//! - `service_checks`: one row per service per round, keyed to its round

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::models::{RoundHeader, RoundRecord, ScorePoint, ServiceResult, ServiceStats};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDirectory { path: PathBuf, source: std::io::Error },
}

#[async_trait]
pub trait ResultLog: Send + Sync {
    /// Persists the round header and every per-service row, or nothing.
    async fn save_round(&self, round: &RoundRecord) -> Result<i64, StoreError>;
    async fn cumulative_score(&self) -> Result<u64, StoreError>;
    async fn round_count(&self) -> Result<u64, StoreError>;
    /// Newest first.
    async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundHeader>, StoreError>;
    async fn service_stats(&self) -> Result<HashMap<String, ServiceStats>, StoreError>;
    /// Oldest first, covering the newest `limit` rounds.
    async fn score_history(&self, limit: usize) -> Result<Vec<ScorePoint>, StoreError>;
    async fn last_round_results(&self) -> Result<HashMap<String, ServiceResult>, StoreError>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS check_rounds (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp   TEXT    NOT NULL,
        round_score INTEGER NOT NULL,
        max_score   INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS service_checks (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        round_id      INTEGER NOT NULL,
        service_id    TEXT    NOT NULL,
        up            INTEGER NOT NULL,
        points_earned INTEGER NOT NULL,
        message       TEXT,
        FOREIGN KEY (round_id) REFERENCES check_rounds(id),
        UNIQUE (round_id, service_id)
    );

    CREATE INDEX IF NOT EXISTS idx_sc_round   ON service_checks(round_id);
    CREATE INDEX IF NOT EXISTS idx_sc_service ON service_checks(service_id);
";

#[derive(Clone)]
pub struct SqliteLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let log = Self::init(conn)?;
        info!("Result log opened at {}", path.display());
        Ok(log)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Runs blocking SQLite work off the async executor. The mutex makes
    /// writes strictly sequential.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let value = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await??;
        Ok(value)
    }
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl ResultLog for SqliteLog {
    async fn save_round(&self, round: &RoundRecord) -> Result<i64, StoreError> {
        let round = round.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO check_rounds (timestamp, round_score, max_score) VALUES (?1, ?2, ?3)",
                params![round.timestamp, round.round_score, round.max_score],
            )?;
            let round_id = tx.last_insert_rowid();
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO service_checks (round_id, service_id, up, points_earned, message)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for r in &round.results {
                    stmt.execute(params![round_id, r.service_id, r.up, r.points_earned, r.message])?;
                }
            }
            tx.commit()?;
            Ok(round_id)
        })
        .await
    }

    async fn cumulative_score(&self) -> Result<u64, StoreError> {
        let total = self
            .with_conn(|conn| {
                conn.query_row("SELECT COALESCE(SUM(round_score), 0) FROM check_rounds", [], |row| {
                    row.get::<_, i64>(0)
                })
            })
            .await?;
        Ok(non_negative(total))
    }

    async fn round_count(&self) -> Result<u64, StoreError> {
        let count = self
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM check_rounds", [], |row| row.get::<_, i64>(0)))
            .await?;
        Ok(non_negative(count))
    }

    async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundHeader>, StoreError> {
        let limit = limit as i64;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, round_score, max_score FROM check_rounds ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(RoundHeader {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    round_score: row.get(2)?,
                    max_score: row.get(3)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn service_stats(&self) -> Result<HashMap<String, ServiceStats>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT service_id, COUNT(*), SUM(up), SUM(points_earned)
                 FROM service_checks GROUP BY service_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    ServiceStats {
                        total_checks: non_negative(row.get(1)?),
                        up_count: non_negative(row.get(2)?),
                        total_points: non_negative(row.get(3)?),
                    },
                ))
            })?;
            rows.collect()
        })
        .await
    }

    async fn score_history(&self, limit: usize) -> Result<Vec<ScorePoint>, StoreError> {
        let limit = limit as i64;
        let mut points = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, round_score, max_score FROM check_rounds ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], |row| {
                    Ok(ScorePoint {
                        timestamp: row.get(0)?,
                        round_score: row.get(1)?,
                        max_score: row.get(2)?,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        points.reverse();
        Ok(points)
    }

    async fn last_round_results(&self) -> Result<HashMap<String, ServiceResult>, StoreError> {
        self.with_conn(|conn| {
            let round_id: Option<i64> = conn
                .query_row("SELECT id FROM check_rounds ORDER BY id DESC LIMIT 1", [], |row| row.get(0))
                .optional()?;
            let Some(round_id) = round_id else {
                return Ok(HashMap::new());
            };

            let mut stmt = conn.prepare(
                "SELECT service_id, up, points_earned, COALESCE(message, '')
                 FROM service_checks WHERE round_id = ?1",
            )?;
            let rows = stmt.query_map(params![round_id], |row| {
                let result = ServiceResult {
                    service_id: row.get(0)?,
                    up: row.get(1)?,
                    points_earned: row.get(2)?,
                    message: row.get(3)?,
                };
                Ok((result.service_id.clone(), result))
            })?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn result(id: &str, up: bool, points: u32) -> ServiceResult {
        ServiceResult {
            service_id: id.into(),
            up,
            points_earned: if up { points } else { 0 },
            message: if up { "ok".into() } else { "down".into() },
        }
    }

    fn round(ts: &str, web_up: bool, ftp_up: bool) -> RoundRecord {
        let results = vec![result("web", web_up, 100), result("ftp", ftp_up, 50)];
        RoundRecord {
            timestamp: ts.into(),
            round_score: results.iter().map(|r| r.points_earned).sum(),
            max_score: 150,
            results,
        }
    }

    #[tokio::test]
    async fn aggregates_across_rounds() {
        let temp_dir = TempDir::new().unwrap();
        let log = SqliteLog::open(temp_dir.path().join("nested").join("scores.db")).unwrap();

        log.save_round(&round("2026-10-16 10:00:00", true, true)).await.unwrap();
        log.save_round(&round("2026-10-16 10:01:00", true, false)).await.unwrap();
        log.save_round(&round("2026-10-16 10:02:00", false, false)).await.unwrap();

        assert_eq!(log.round_count().await.unwrap(), 3);
        assert_eq!(log.cumulative_score().await.unwrap(), 150 + 100);

        let stats = log.service_stats().await.unwrap();
        assert_eq!(stats["web"], ServiceStats { total_checks: 3, up_count: 2, total_points: 200 });
        assert_eq!(stats["ftp"], ServiceStats { total_checks: 3, up_count: 1, total_points: 50 });
        assert_eq!(stats["web"].uptime_pct(), 66.7);
    }

    #[tokio::test]
    async fn recent_is_newest_first_history_is_oldest_first() {
        let log = SqliteLog::open_in_memory().unwrap();
        for minute in 0..5 {
            log.save_round(&round(&format!("2026-10-16 10:0{}:00", minute), true, minute % 2 == 0))
                .await
                .unwrap();
        }

        let recent = log.recent_rounds(3).await.unwrap();
        let stamps: Vec<_> = recent.iter().map(|r| r.timestamp.as_str()).collect();
        assert_eq!(stamps, ["2026-10-16 10:04:00", "2026-10-16 10:03:00", "2026-10-16 10:02:00"]);

        let history = log.score_history(3).await.unwrap();
        let stamps: Vec<_> = history.iter().map(|p| p.timestamp.as_str()).collect();
        assert_eq!(stamps, ["2026-10-16 10:02:00", "2026-10-16 10:03:00", "2026-10-16 10:04:00"]);
        assert_eq!(history[0].round_score, 150);
        assert_eq!(history[1].round_score, 100);
    }

    #[tokio::test]
    async fn failed_round_leaves_no_rows() {
        let log = SqliteLog::open_in_memory().unwrap();
        let mut bad = round("2026-10-16 10:00:00", true, true);
        bad.results.push(result("web", true, 100));

        assert!(log.save_round(&bad).await.is_err());
        assert_eq!(log.round_count().await.unwrap(), 0);
        assert!(log.service_stats().await.unwrap().is_empty());
        assert_eq!(log.cumulative_score().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn last_round_results_reads_newest() {
        let log = SqliteLog::open_in_memory().unwrap();
        assert!(log.last_round_results().await.unwrap().is_empty());

        log.save_round(&round("2026-10-16 10:00:00", true, true)).await.unwrap();
        log.save_round(&round("2026-10-16 10:01:00", true, false)).await.unwrap();

        let last = log.last_round_results().await.unwrap();
        assert_eq!(last.len(), 2);
        assert!(last["web"].up);
        assert!(!last["ftp"].up);
        assert_eq!(last["ftp"].points_earned, 0);
    }
}
