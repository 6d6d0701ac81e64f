pub mod models;


use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub use models::*;

/// Narrow view of persistence the scheduler and workers depend on.
///
/// Every method must give read-your-own-writes consistency: a committed
/// status is visible to the next `episodes_needing_work` call.
pub trait EpisodeStore: Send + Sync {
    fn get_episode(&self, id: i64) -> Result<Option<Episode>>;

    fn get_status(&self, episode_id: i64) -> Result<Option<ProcessingStatus>>;

    /// Episodes where some stage is ready and `retry_count < max_retries`,
    /// newest publish date first.
    fn episodes_needing_work(&self, limit: usize, max_retries: u32)
        -> Result<Vec<EpisodeWithStatus>>;

    /// Persist `status`. Stage flags and `retry_count` never move backwards,
    /// whatever the caller passes.
    fn commit_status(&self, status: &ProcessingStatus) -> Result<()>;

    /// Replace the stored insights for an episode.
    fn save_insights(&self, episode_id: i64, insights: &[Insight]) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineCounts {
    pub total: i64,
    pub downloaded: i64,
    pub transcribed: i64,
    pub analyzed: i64,
    /// Unfinished episodes whose retry budget is spent
    pub stuck: i64,
}

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

const EPISODE_WITH_STATUS_COLUMNS: &str = "
    e.id, e.feed_id, e.guid, e.title, e.audio_url, e.publish_date, e.duration,
    s.is_downloaded, s.is_transcribed, s.is_analyzed, s.download_path, s.transcript_path,
    s.download_started_at, s.download_completed_at,
    s.transcription_started_at, s.transcription_completed_at,
    s.analysis_started_at, s.analysis_completed_at,
    s.error_message, s.retry_count";

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_id INTEGER NOT NULL,
                guid TEXT UNIQUE,
                title TEXT NOT NULL,
                audio_url TEXT NOT NULL UNIQUE,
                publish_date TEXT NOT NULL,
                duration INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_published
                ON episodes(publish_date DESC);
            CREATE INDEX IF NOT EXISTS idx_feed_publish_date
                ON episodes(feed_id, publish_date);

            CREATE TABLE IF NOT EXISTS processing_status (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL UNIQUE,
                is_downloaded INTEGER NOT NULL DEFAULT 0,
                is_transcribed INTEGER NOT NULL DEFAULT 0,
                is_analyzed INTEGER NOT NULL DEFAULT 0,
                download_path TEXT,
                transcript_path TEXT,
                download_started_at TEXT,
                download_completed_at TEXT,
                transcription_started_at TEXT,
                transcription_completed_at TEXT,
                analysis_started_at TEXT,
                analysis_completed_at TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_unprocessed_episodes
                ON processing_status(is_downloaded, is_transcribed, is_analyzed);

            CREATE TABLE IF NOT EXISTS insights (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL,
                category TEXT NOT NULL,
                summary TEXT NOT NULL,
                confidence REAL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_insights_episode ON insights(episode_id);
            "#,
        )?;
        Ok(())
    }

    // =========================================================================
    // Episodes
    // =========================================================================

    /// Insert a new episode (with a fresh status row) or update an existing
    /// one matched by audio_url. Returns `(id, is_new)`.
    pub fn upsert_episode(
        &self,
        feed_id: i64,
        guid: Option<&str>,
        title: &str,
        audio_url: &str,
        publish_date: DateTime<Utc>,
        duration: Option<i64>,
    ) -> Result<(i64, bool)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM episodes WHERE audio_url = ?",
                params![audio_url],
                |row| row.get(0),
            )
            .optional()?;

        let result = if let Some(id) = existing_id {
            tx.execute(
                "UPDATE episodes SET
                    guid = COALESCE(?, guid),
                    title = ?,
                    publish_date = ?,
                    duration = COALESCE(?, duration)
                 WHERE id = ?",
                params![guid, title, publish_date, duration, id],
            )?;
            (id, false)
        } else {
            tx.execute(
                "INSERT INTO episodes (feed_id, guid, title, audio_url, publish_date, duration)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![feed_id, guid, title, audio_url, publish_date, duration],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO processing_status (episode_id) VALUES (?)",
                params![id],
            )?;
            (id, true)
        };

        tx.commit()?;
        Ok(result)
    }

    pub fn get_episode_with_status(&self, id: i64) -> Result<Option<EpisodeWithStatus>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM episodes e JOIN processing_status s ON s.episode_id = e.id
             WHERE e.id = ?",
            EPISODE_WITH_STATUS_COLUMNS
        );
        let item = conn
            .query_row(&sql, params![id], row_to_episode_with_status)
            .optional()?;
        Ok(item)
    }

    // =========================================================================
    // Operator actions
    // =========================================================================

    /// Give a stuck episode a fresh retry budget. This is the only path that
    /// lowers `retry_count`; the scheduler never calls it.
    pub fn reset_retries(&self, episode_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE processing_status
             SET retry_count = 0, error_message = NULL, updated_at = datetime('now')
             WHERE episode_id = ?",
            params![episode_id],
        )?;
        Ok(changed > 0)
    }

    pub fn get_insights(&self, episode_id: i64) -> Result<Vec<Insight>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT category, summary, confidence FROM insights
             WHERE episode_id = ? ORDER BY id",
        )?;
        let insights = stmt
            .query_map(params![episode_id], |row| {
                Ok(Insight {
                    category: row.get(0)?,
                    summary: row.get(1)?,
                    confidence: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(insights)
    }

    pub fn pipeline_counts(&self, max_retries: u32) -> Result<PipelineCounts> {
        let conn = self.conn()?;
        let counts = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(is_downloaded), 0),
                    COALESCE(SUM(is_transcribed), 0),
                    COALESCE(SUM(is_analyzed), 0),
                    COALESCE(SUM(CASE WHEN is_analyzed = 0 AND retry_count >= ? THEN 1 ELSE 0 END), 0)
             FROM processing_status",
            params![max_retries],
            |row| {
                Ok(PipelineCounts {
                    total: row.get(0)?,
                    downloaded: row.get(1)?,
                    transcribed: row.get(2)?,
                    analyzed: row.get(3)?,
                    stuck: row.get(4)?,
                })
            },
        )?;
        Ok(counts)
    }
}

impl EpisodeStore for Database {
    fn get_episode(&self, id: i64) -> Result<Option<Episode>> {
        let conn = self.conn()?;
        let episode = conn
            .query_row(
                "SELECT id, feed_id, guid, title, audio_url, publish_date, duration
                 FROM episodes WHERE id = ?",
                params![id],
                |row| row_to_episode(row, 0),
            )
            .optional()?;
        Ok(episode)
    }

    fn get_status(&self, episode_id: i64) -> Result<Option<ProcessingStatus>> {
        Ok(self.get_episode_with_status(episode_id)?.map(|item| item.status))
    }

    fn episodes_needing_work(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<EpisodeWithStatus>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM episodes e JOIN processing_status s ON s.episode_id = e.id
             WHERE s.retry_count < ?1
               AND (s.is_downloaded = 0
                    OR (s.is_downloaded = 1 AND s.is_transcribed = 0)
                    OR (s.is_transcribed = 1 AND s.is_analyzed = 0))
             ORDER BY e.publish_date DESC
             LIMIT ?2",
            EPISODE_WITH_STATUS_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params![max_retries, limit as i64], row_to_episode_with_status)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn commit_status(&self, status: &ProcessingStatus) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE processing_status SET
                is_downloaded = MAX(is_downloaded, ?),
                is_transcribed = MAX(is_transcribed, ?),
                is_analyzed = MAX(is_analyzed, ?),
                download_path = COALESCE(?, download_path),
                transcript_path = COALESCE(?, transcript_path),
                download_started_at = COALESCE(?, download_started_at),
                download_completed_at = COALESCE(?, download_completed_at),
                transcription_started_at = COALESCE(?, transcription_started_at),
                transcription_completed_at = COALESCE(?, transcription_completed_at),
                analysis_started_at = COALESCE(?, analysis_started_at),
                analysis_completed_at = COALESCE(?, analysis_completed_at),
                error_message = ?,
                retry_count = MAX(retry_count, ?),
                updated_at = datetime('now')
             WHERE episode_id = ?",
            params![
                status.is_downloaded,
                status.is_transcribed,
                status.is_analyzed,
                status.download_path,
                status.transcript_path,
                status.download_started_at,
                status.download_completed_at,
                status.transcription_started_at,
                status.transcription_completed_at,
                status.analysis_started_at,
                status.analysis_completed_at,
                status.error_message,
                status.retry_count,
                status.episode_id,
            ],
        )?;
        if changed == 0 {
            bail!("No processing status for episode {}", status.episode_id);
        }
        Ok(())
    }

    fn save_insights(&self, episode_id: i64, insights: &[Insight]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM insights WHERE episode_id = ?", params![episode_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO insights (episode_id, category, summary, confidence)
                 VALUES (?, ?, ?, ?)",
            )?;
            for insight in insights {
                stmt.execute(params![
                    episode_id,
                    insight.category,
                    insight.summary,
                    insight.confidence
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn row_to_episode(row: &Row<'_>, offset: usize) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(offset)?,
        feed_id: row.get(offset + 1)?,
        guid: row.get(offset + 2)?,
        title: row.get(offset + 3)?,
        audio_url: row.get(offset + 4)?,
        publish_date: row.get(offset + 5)?,
        duration: row.get(offset + 6)?,
    })
}

fn row_to_episode_with_status(row: &Row<'_>) -> rusqlite::Result<EpisodeWithStatus> {
    let episode = row_to_episode(row, 0)?;
    let status = ProcessingStatus {
        episode_id: episode.id,
        is_downloaded: row.get::<_, i32>(7)? == 1,
        is_transcribed: row.get::<_, i32>(8)? == 1,
        is_analyzed: row.get::<_, i32>(9)? == 1,
        download_path: row.get(10)?,
        transcript_path: row.get(11)?,
        download_started_at: row.get(12)?,
        download_completed_at: row.get(13)?,
        transcription_started_at: row.get(14)?,
        transcription_completed_at: row.get(15)?,
        analysis_started_at: row.get(16)?,
        analysis_completed_at: row.get(17)?,
        error_message: row.get(18)?,
        retry_count: row.get(19)?,
    };
    Ok(EpisodeWithStatus { episode, status })
}
