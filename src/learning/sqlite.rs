use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, warn};

use super::{
    rank_similar, LearningStats, LearningStore, LearningStoreError, SimilarRecord,
    ToolExecutionRecord,
};
use crate::analysis::ImageAnalysis;
use crate::settings::SimilarityWeights;
use crate::tools::ToolName;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SqliteLearningStore {
    db_path: PathBuf,
    capacity: usize,
    scan_limit: usize,
    persist_threshold: u8,
    weights: SimilarityWeights,
}

impl SqliteLearningStore {
    pub fn new(
        db_path: impl Into<PathBuf>,
        capacity: usize,
        scan_limit: usize,
        persist_threshold: u8,
        weights: SimilarityWeights,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            capacity: capacity.max(1),
            scan_limit: scan_limit.max(1),
            persist_threshold,
            weights,
        }
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn initialize(&self) -> Result<(), LearningStoreError> {
        self.with_connection(|_| Ok(()))
    }

    fn with_connection<T, F>(&self, func: F) -> Result<T, LearningStoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LearningStoreError>,
    {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LearningStoreError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let mut conn = Connection::open(self.db_path.as_path())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        ensure_schema(&conn)?;
        func(&mut conn)
    }

    fn try_record(&self, record: &ToolExecutionRecord) -> Result<(), LearningStoreError> {
        let payload = serde_json::to_string(record)?;
        let capacity = to_sql_count(self.capacity);
        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "
                INSERT INTO tool_execution_records
                  (id, tool, success, confidence, record_json, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    record.id,
                    record.tool.as_str(),
                    record.success,
                    record.confidence,
                    payload,
                    record.recorded_at,
                ],
            )?;
            tx.execute(
                "
                DELETE FROM tool_execution_records
                WHERE seq NOT IN (
                  SELECT seq FROM tool_execution_records ORDER BY seq DESC LIMIT ?1
                )
                ",
                params![capacity],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn try_load_recent(&self, tool: ToolName) -> Result<Vec<ToolExecutionRecord>, LearningStoreError> {
        let threshold = self.persist_threshold;
        let scan_limit = to_sql_count(self.scan_limit);
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT record_json
                FROM tool_execution_records
                WHERE tool = ?1 AND success = 1 AND confidence >= ?2
                ORDER BY seq DESC
                LIMIT ?3
                ",
            )?;
            let rows = stmt.query_map(params![tool.as_str(), threshold, scan_limit], |row| {
                row.get::<_, String>(0)
            })?;
            let mut records = Vec::new();
            for row in rows {
                let raw = row?;
                match serde_json::from_str::<ToolExecutionRecord>(raw.as_str()) {
                    Ok(record) => records.push(record),
                    Err(error) => {
                        warn!(error = %error, "skipping unreadable learning record");
                    }
                }
            }
            Ok(records)
        })
    }

    fn try_prune(&self, keep_most_recent: usize) -> Result<usize, LearningStoreError> {
        let keep = to_sql_count(keep_most_recent);
        self.with_connection(|conn| {
            let removed = conn.execute(
                "
                DELETE FROM tool_execution_records
                WHERE seq NOT IN (
                  SELECT seq FROM tool_execution_records ORDER BY seq DESC LIMIT ?1
                )
                ",
                params![keep],
            )?;
            Ok(removed)
        })
    }

    fn try_stats(&self) -> Result<LearningStats, LearningStoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tool, COUNT(*) FROM tool_execution_records GROUP BY tool ORDER BY tool",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut records_by_tool = BTreeMap::new();
            let mut total_records = 0usize;
            for row in rows {
                let (tool, count) = row?;
                let count = usize::try_from(count).map_err(|_| {
                    LearningStoreError::InvalidRecord(format!("negative count for tool '{tool}'"))
                })?;
                total_records += count;
                records_by_tool.insert(tool, count);
            }
            Ok(LearningStats {
                backend: String::from("sqlite"),
                total_records,
                records_by_tool,
            })
        })
    }
}

impl LearningStore for SqliteLearningStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn record(&self, record: ToolExecutionRecord) -> bool {
        if !record.is_persistable(self.persist_threshold) {
            debug!(
                tool = %record.tool,
                confidence = record.confidence,
                "learning record below persistence threshold, skipped"
            );
            return false;
        }
        match self.try_record(&record) {
            Ok(()) => true,
            Err(error) => {
                warn!(error = %error, tool = %record.tool, "failed to persist learning record");
                false
            }
        }
    }

    fn find_similar(
        &self,
        tool: ToolName,
        analysis: &ImageAnalysis,
        limit: usize,
    ) -> Vec<SimilarRecord> {
        match self.try_load_recent(tool) {
            Ok(records) => rank_similar(
                records.iter(),
                tool,
                analysis,
                limit,
                self.persist_threshold,
                &self.weights,
            ),
            Err(error) => {
                warn!(
                    error = %error,
                    tool = %tool,
                    "learning lookup failed, continuing without history"
                );
                Vec::new()
            }
        }
    }

    fn prune(&self, keep_most_recent: usize) -> usize {
        self.try_prune(keep_most_recent).unwrap_or_else(|error| {
            warn!(error = %error, "learning prune failed");
            0
        })
    }

    fn stats(&self) -> LearningStats {
        self.try_stats().unwrap_or_else(|error| {
            warn!(error = %error, "learning stats unavailable");
            LearningStats {
                backend: self.backend_name().to_string(),
                ..LearningStats::default()
            }
        })
    }
}

fn to_sql_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn ensure_schema(conn: &Connection) -> Result<(), LearningStoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tool_execution_records (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          id TEXT NOT NULL UNIQUE,
          tool TEXT NOT NULL,
          success INTEGER NOT NULL,
          confidence INTEGER NOT NULL,
          record_json TEXT NOT NULL,
          recorded_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tool_execution_records_tool_seq
          ON tool_execution_records(tool, seq);
        ",
    )?;
    Ok(())
}
