//! Work item operations: insert, guarded state transitions, listing, recovery.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::work::*;
use crate::telemetry::metrics;

const COLUMNS: &str =
    "id, artifact_ref, state, attempt_count, last_error, result, created_at, updated_at";

/// Outcome of startup recovery of items left `InFlight` by a crash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Moved to `FailedRetryable`, attempt count unchanged.
    pub requeued: u64,
    /// Already at `max_attempts`; moved to `FailedTerminal`.
    pub exhausted: u64,
}

/// Number of items per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub done: u64,
    pub failed_retryable: u64,
    pub failed_terminal: u64,
}

impl StateCounts {
    pub fn get(&self, state: State) -> u64 {
        match state {
            State::Pending => self.pending,
            State::InFlight => self.in_flight,
            State::Done => self.done,
            State::FailedRetryable => self.failed_retryable,
            State::FailedTerminal => self.failed_terminal,
        }
    }

    fn slot(&mut self, state: State) -> &mut u64 {
        match state {
            State::Pending => &mut self.pending,
            State::InFlight => &mut self.in_flight,
            State::Done => &mut self.done,
            State::FailedRetryable => &mut self.failed_retryable,
            State::FailedTerminal => &mut self.failed_terminal,
        }
    }
}

impl super::Store {
    /// Insert a new `Pending` item. The store assigns the id.
    pub async fn put(&self, new: NewWorkItem) -> Result<WorkItem> {
        let created_at = new.created_at.timestamp_millis();
        let row: WorkItemRow = sqlx::query_as(&format!(
            "INSERT INTO work_items (artifact_ref, state, attempt_count, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?3)
             RETURNING {COLUMNS}"
        ))
        .bind(new.artifact_ref.as_str())
        .bind(State::Pending.as_str())
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into_work_item()
    }

    /// Get a work item by ID.
    pub async fn get(&self, id: WorkId) -> Result<WorkItem> {
        let row: Option<WorkItemRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM work_items WHERE id = ?1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or(Error::NotFound(id))?.try_into_work_item()
    }

    /// Transition a work item's state with optimistic concurrency.
    ///
    /// The row is only written if it is still in `expected`. Otherwise the
    /// call fails with [`Error::Conflict`] (or [`Error::NotFound`]) and
    /// nothing changes.
    pub async fn update_state(
        &self,
        id: WorkId,
        expected: State,
        update: StateUpdate,
    ) -> Result<WorkItem> {
        if !expected.can_transition_to(update.to) {
            return Err(Error::InvalidTransition {
                from: expected,
                to: update.to,
            });
        }

        let now = Utc::now().timestamp_millis();
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items
             SET state = ?1, attempt_count = ?2,
                 last_error = COALESCE(?3, last_error),
                 result = COALESCE(?4, result),
                 updated_at = ?5
             WHERE id = ?6 AND state = ?7
             RETURNING {COLUMNS}"
        ))
        .bind(update.to.as_str())
        .bind(i64::from(update.attempt_count))
        .bind(update.last_error.as_deref())
        .bind(update.result.as_deref())
        .bind(now)
        .bind(id.0)
        .bind(expected.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            let actual = self.get(id).await?.state;
            return Err(Error::Conflict {
                id,
                expected,
                actual,
            });
        };

        metrics::state_transitions().add(
            1,
            &[
                KeyValue::new("from", expected.as_str()),
                KeyValue::new("to", update.to.as_str()),
            ],
        );

        row.try_into_work_item()
    }

    /// List items in any of `states`, oldest first (ties broken by id).
    pub async fn list(&self, states: &[State]) -> Result<Vec<WorkItem>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            "SELECT {COLUMNS} FROM work_items WHERE state IN ({placeholders})
             ORDER BY created_at ASC, id ASC"
        );
        let mut query = sqlx::query_as::<_, WorkItemRow>(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }

        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(WorkItemRow::try_into_work_item)
            .collect()
    }

    /// Terminal items whose last transition happened at or before `cutoff`.
    pub async fn list_settled_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkItem>> {
        sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {COLUMNS} FROM work_items
             WHERE state IN (?1, ?2) AND updated_at <= ?3
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(State::Done.as_str())
        .bind(State::FailedTerminal.as_str())
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(WorkItemRow::try_into_work_item)
        .collect()
    }

    /// Delete a work item record. Returns false if it was already gone.
    pub async fn delete(&self, id: WorkId) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM work_items WHERE id = ?1")
            .bind(id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    /// Resolve items a previous process left `InFlight`.
    ///
    /// Their attempt was already counted at claim time, so the count is kept.
    /// Items that have used up `max_attempts` go terminal instead of being
    /// retried once more.
    pub async fn recover_in_flight(&self, max_attempts: u32) -> Result<RecoveryReport> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let exhausted = sqlx::query(
            "UPDATE work_items SET state = ?1, last_error = ?2, updated_at = ?3
             WHERE state = ?4 AND attempt_count >= ?5",
        )
        .bind(State::FailedTerminal.as_str())
        .bind("interrupted during delivery; attempts exhausted")
        .bind(now)
        .bind(State::InFlight.as_str())
        .bind(i64::from(max_attempts))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            "UPDATE work_items SET state = ?1, last_error = ?2, updated_at = ?3
             WHERE state = ?4",
        )
        .bind(State::FailedRetryable.as_str())
        .bind("interrupted during delivery")
        .bind(now)
        .bind(State::InFlight.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        for (to, n) in [
            (State::FailedTerminal, exhausted),
            (State::FailedRetryable, requeued),
        ] {
            if n > 0 {
                metrics::state_transitions().add(
                    n,
                    &[
                        KeyValue::new("from", State::InFlight.as_str()),
                        KeyValue::new("to", to.as_str()),
                    ],
                );
            }
        }

        Ok(RecoveryReport {
            requeued,
            exhausted,
        })
    }

    /// Count items per state.
    pub async fn counts_by_state(&self) -> Result<StateCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM work_items GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StateCounts::default();
        for (state, n) in rows {
            *counts.slot(state.parse()?) = u64::try_from(n).unwrap_or(0);
        }
        Ok(counts)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: i64,
    artifact_ref: String,
    state: String,
    attempt_count: i64,
    last_error: Option<String>,
    result: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl WorkItemRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: WorkId(self.id),
            artifact_ref: ArtifactRef::new(self.artifact_ref),
            state: self.state.parse()?,
            attempt_count: u32::try_from(self.attempt_count)
                .map_err(|_| Error::Other(format!("bad attempt_count on item {}", self.id)))?,
            last_error: self.last_error,
            result: self.result,
            created_at: millis_to_utc(self.created_at)?,
            updated_at: millis_to_utc(self.updated_at)?,
        })
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Other(format!("timestamp out of range: {ms}")))
}
