//! Result cache: last classification per (account, message)

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Row};
use tracing::debug;

use crate::db::Database;
use crate::error::Result;
use crate::models::{Classification, ClassifiedResult, EmailMessage};

#[derive(Clone)]
pub struct ResultCache {
    db: Database,
}

impl ResultCache {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or overwrite the row for this result's (account id, message id)
    pub fn upsert(&self, result: &ClassifiedResult) -> Result<()> {
        let reasons = serde_json::to_string(&result.classification.reasons)?;
        let message = serde_json::to_string(&result.message)?;
        let c = &result.classification;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO classifications (
                    account_id, message_id, urgency_score, importance_score,
                    is_urgent, is_important, reasons, message, cached_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(account_id, message_id) DO UPDATE SET
                    urgency_score = excluded.urgency_score,
                    importance_score = excluded.importance_score,
                    is_urgent = excluded.is_urgent,
                    is_important = excluded.is_important,
                    reasons = excluded.reasons,
                    message = excluded.message,
                    cached_at = excluded.cached_at",
                params![
                    result.account_id,
                    result.message.id,
                    c.urgency_score,
                    c.importance_score,
                    c.is_urgent,
                    c.is_important,
                    reasons,
                    message,
                    result.cached_at,
                ],
            )
        })?;

        debug!(
            "Cached classification for {}/{}",
            result.account_id, result.message.id
        );
        Ok(())
    }

    /// Cached rows for an account, most urgent first
    pub fn list_for_account(&self, account_id: &str) -> Result<Vec<ClassifiedResult>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.account_id, a.name, c.urgency_score, c.importance_score,
                        c.is_urgent, c.is_important, c.reasons, c.message, c.cached_at
                 FROM classifications c
                 JOIN accounts a ON a.id = c.account_id
                 WHERE c.account_id = ?1
                 ORDER BY (c.urgency_score * 2 + c.importance_score) DESC,
                          c.cached_at DESC, c.message_id ASC",
            )?;
            let rows = stmt.query_map(params![account_id], row_to_result)?;
            rows.collect()
        })
    }

    pub fn count_for_account(&self, account_id: &str) -> Result<usize> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM classifications WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_result(row: &Row<'_>) -> rusqlite::Result<ClassifiedResult> {
    let message: EmailMessage = json_column(row, 7)?;
    let cached_at: DateTime<Utc> = row.get(8)?;

    Ok(ClassifiedResult {
        account_id: row.get(0)?,
        account_name: row.get(1)?,
        message,
        classification: Classification {
            urgency_score: row.get(2)?,
            importance_score: row.get(3)?,
            is_urgent: row.get(4)?,
            is_important: row.get(5)?,
            reasons: json_column(row, 6)?,
        },
        cached_at,
    })
}
