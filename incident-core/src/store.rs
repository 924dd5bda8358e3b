//! Durable incident records plus the append-only audit trail.
//!
//! Both tables live in one SQLite database. Every write that changes an
//! incident's status also appends the matching [`IncidentEvent`] inside the
//! same transaction, so the two can never drift apart.

use crate::error::StoreError;
use crate::stats::{compute_statistics, IncidentStatistics};
use chrono::{DateTime, Utc};
use incident_model::{
    format_timestamp, EventType, Incident, IncidentEvent, IncidentStatus, Provider,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_LIST_LIMIT: u32 = 100;
const MAX_LIST_LIMIT: u32 = 1000;

const INCIDENT_COLUMNS: &str = "id, service_name, repository, error_message, stack_trace, \
     severity, status, source, metadata, workflow_run_id, pr_url, diagnosis, \
     created_at, updated_at, triggered_at, completed_at";

/// Conjunctive filter for listing and statistics. Absent fields match everything.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct IncidentFilter {
    pub status: Option<String>,
    pub service: Option<String>,
    pub repository: Option<String>,
    pub provider: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Result of an insert that is subject to the deduplication window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    Duplicate { existing_id: String },
}

/// A committed status change.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub previous: IncidentStatus,
    pub incident: Incident,
}

/// Optional fields written alongside a status change.
#[derive(Clone, Debug, Default)]
pub struct StatusUpdate {
    pub workflow_run_id: Option<String>,
    pub pr_url: Option<String>,
    pub diagnosis: Option<String>,
    pub data: Option<Value>,
}

#[derive(Clone)]
pub struct IncidentStore {
    conn: Arc<Mutex<Connection>>,
}

impl IncidentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys=ON;
            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                service_name TEXT NOT NULL,
                repository TEXT NOT NULL DEFAULT '',
                error_message TEXT NOT NULL,
                stack_trace TEXT,
                severity TEXT NOT NULL,
                status TEXT NOT NULL,
                source TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                workflow_run_id TEXT,
                pr_url TEXT,
                diagnosis TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                triggered_at TEXT,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_incidents_dedup
                ON incidents(service_name, error_message, created_at);
            CREATE INDEX IF NOT EXISTS idx_incidents_created ON incidents(created_at);
            CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents(status);

            CREATE TABLE IF NOT EXISTS incident_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id TEXT NOT NULL REFERENCES incidents(id) ON DELETE CASCADE,
                event_type TEXT NOT NULL,
                event_data TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_incident ON incident_events(incident_id, id);
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Inserts `incident` with its `received` event unless an incident with
    /// the same service and error message was created inside `window`.
    ///
    /// The lookup and the insert share one immediate transaction, so two
    /// concurrent duplicates cannot both be inserted. A suppressed duplicate
    /// is recorded on the existing incident as a `duplicate_suppressed` event.
    pub fn create_or_correlate(
        &self,
        incident: &Incident,
        window: Duration,
    ) -> Result<CreateOutcome, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !window.is_zero() {
            let since = chrono::Duration::from_std(window)
                .ok()
                .and_then(|w| incident.created_at.checked_sub_signed(w))
                .map(|ts| format_timestamp(&ts))
                .unwrap_or_default();

            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM incidents
                     WHERE service_name = ?1 AND error_message = ?2 AND created_at > ?3
                     ORDER BY created_at ASC
                     LIMIT 1",
                    params![incident.service_name, incident.error_message, since],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                let data = serde_json::json!({
                    "source": incident.source.as_str(),
                    "external_id": incident.metadata.get("external_id"),
                    "suppressed_id": incident.id,
                });
                insert_event(&tx, &existing_id, EventType::DuplicateSuppressed, Some(&data), &Utc::now())?;
                tx.commit()?;
                return Ok(CreateOutcome::Duplicate { existing_id });
            }
        }

        tx.execute(
            &format!("INSERT INTO incidents ({INCIDENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"),
            params![
                incident.id,
                incident.service_name,
                incident.repository,
                incident.error_message,
                incident.stack_trace,
                incident.severity.as_str(),
                incident.status.as_str(),
                incident.source.as_str(),
                serde_json::to_string(&incident.metadata)?,
                incident.workflow_run_id,
                incident.pr_url,
                incident.diagnosis,
                format_timestamp(&incident.created_at),
                format_timestamp(&incident.updated_at),
                incident.triggered_at.as_ref().map(format_timestamp),
                incident.completed_at.as_ref().map(format_timestamp),
            ],
        )?;
        insert_event(&tx, &incident.id, EventType::Received, None, &incident.created_at)?;
        tx.commit()?;
        Ok(CreateOutcome::Created)
    }

    pub fn get(&self, id: &str) -> Result<Option<Incident>, StoreError> {
        let conn = self.lock()?;
        let incident = conn
            .query_row(
                &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1"),
                params![id],
                map_incident,
            )
            .optional()?;
        Ok(incident)
    }

    /// Matching incidents, newest first.
    pub fn list(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, StoreError> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        self.query_incidents(filter, Some(limit))
    }

    /// Statistics over every incident matching `filter`; `limit` is ignored.
    pub fn statistics(&self, filter: &IncidentFilter) -> Result<IncidentStatistics, StoreError> {
        let incidents = self.query_incidents(filter, None)?;
        Ok(compute_statistics(&incidents))
    }

    fn query_incidents(
        &self,
        filter: &IncidentFilter,
        limit: Option<u32>,
    ) -> Result<Vec<Incident>, StoreError> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();

        let mut push = |column: &str, op: &str, value: String| {
            values.push(value);
            clauses.push(format!("{column} {op} ?{}", values.len()));
        };
        if let Some(status) = &filter.status {
            push("status", "=", status.clone());
        }
        if let Some(service) = &filter.service {
            push("service_name", "=", service.clone());
        }
        if let Some(repository) = &filter.repository {
            push("repository", "=", repository.clone());
        }
        if let Some(provider) = &filter.provider {
            push("source", "=", provider.clone());
        }
        if let Some(start) = &filter.start {
            push("created_at", ">=", format_timestamp(start));
        }
        if let Some(end) = &filter.end {
            push("created_at", "<=", format_timestamp(end));
        }

        let mut sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), map_incident)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Moves an incident to `next` and appends the matching audit event in
    /// one transaction. Illegal lifecycle moves are rejected untouched.
    pub fn transition(
        &self,
        id: &str,
        next: IncidentStatus,
        update: StatusUpdate,
    ) -> Result<Transition, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: IncidentStatus = tx
            .query_row(
                "SELECT status FROM incidents WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(IncidentStatus::from)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if !current.can_transition_to(&next) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: next,
            });
        }
        let current_text = current.as_str().to_string();

        let now = Utc::now();
        let now_text = format_timestamp(&now);
        let triggered_at = (next == IncidentStatus::WorkflowTriggered).then(|| now_text.clone());
        let completed_at = (next.is_terminal() || next == IncidentStatus::PrCreated)
            .then(|| now_text.clone());

        tx.execute(
            "UPDATE incidents SET
                status = ?2,
                updated_at = ?3,
                triggered_at = COALESCE(?4, triggered_at),
                completed_at = COALESCE(?5, completed_at),
                workflow_run_id = COALESCE(?6, workflow_run_id),
                pr_url = COALESCE(?7, pr_url),
                diagnosis = COALESCE(?8, diagnosis)
             WHERE id = ?1",
            params![
                id,
                next.as_str(),
                now_text,
                triggered_at,
                completed_at,
                update.workflow_run_id,
                update.pr_url,
                update.diagnosis,
            ],
        )?;

        let mut data = serde_json::json!({
            "from": current_text,
            "to": next.as_str(),
        });
        if let Some(run_id) = &update.workflow_run_id {
            data["workflow_run_id"] = Value::from(run_id.clone());
        }
        if let Some(pr_url) = &update.pr_url {
            data["pr_url"] = Value::from(pr_url.clone());
        }
        if let Some(diagnosis) = &update.diagnosis {
            data["diagnosis"] = Value::from(diagnosis.clone());
        }
        if let Some(extra) = update.data {
            data["details"] = extra;
        }
        insert_event(&tx, id, EventType::for_status(&next), Some(&data), &now)?;

        let incident = tx.query_row(
            &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1"),
            params![id],
            map_incident,
        )?;
        tx.commit()?;
        Ok(Transition {
            previous: current,
            incident,
        })
    }

    /// Records a successful trigger. `attempts` lands in the audit event.
    pub fn mark_triggered(
        &self,
        id: &str,
        external_ref: Option<String>,
        attempts: u32,
    ) -> Result<Transition, StoreError> {
        self.transition(
            id,
            IncidentStatus::WorkflowTriggered,
            StatusUpdate {
                workflow_run_id: external_ref,
                data: Some(serde_json::json!({ "attempts": attempts })),
                ..StatusUpdate::default()
            },
        )
    }

    /// Applies the outcome reported by the remediation runner.
    pub fn complete(
        &self,
        id: &str,
        status: IncidentStatus,
        pr_url: Option<String>,
        diagnosis: Option<String>,
    ) -> Result<Transition, StoreError> {
        self.transition(
            id,
            status,
            StatusUpdate {
                pr_url,
                diagnosis,
                ..StatusUpdate::default()
            },
        )
    }

    /// Appends a non-status event such as `dequeued_for_remediation`.
    pub fn record_event(
        &self,
        incident_id: &str,
        event_type: EventType,
        data: Option<Value>,
    ) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        insert_event(&conn, incident_id, event_type, data.as_ref(), &Utc::now())
    }

    pub fn events_for_incident(&self, incident_id: &str) -> Result<Vec<IncidentEvent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, event_type, event_data, created_at
             FROM incident_events
             WHERE incident_id = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![incident_id], map_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Deletes incidents created before `cutoff`; their events go with them.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM incidents WHERE created_at < ?1",
            params![format_timestamp(&cutoff)],
        )?;
        Ok(removed)
    }
}

fn insert_event(
    conn: &Connection,
    incident_id: &str,
    event_type: EventType,
    data: Option<&Value>,
    at: &DateTime<Utc>,
) -> Result<i64, StoreError> {
    let data = data.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO incident_events (incident_id, event_type, event_data, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![incident_id, event_type.as_str(), data, format_timestamp(at)],
    )?;
    Ok(conn.last_insert_rowid())
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_ts(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| conversion_error(column, err))
}

fn parse_opt_ts(column: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(column, &v)).transpose()
}

fn map_incident(row: &rusqlite::Row<'_>) -> rusqlite::Result<Incident> {
    let severity: String = row.get(5)?;
    let source: String = row.get(7)?;
    let metadata: String = row.get(8)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(Incident {
        id: row.get(0)?,
        service_name: row.get(1)?,
        repository: row.get(2)?,
        error_message: row.get(3)?,
        stack_trace: row.get(4)?,
        severity: severity.parse().map_err(|err| conversion_error(5, err))?,
        status: IncidentStatus::from(row.get::<_, String>(6)?),
        source: source
            .parse::<Provider>()
            .map_err(|err| conversion_error(7, err))?,
        metadata: serde_json::from_str(&metadata).map_err(|err| conversion_error(8, err))?,
        workflow_run_id: row.get(9)?,
        pr_url: row.get(10)?,
        diagnosis: row.get(11)?,
        created_at: parse_ts(12, &created_at)?,
        updated_at: parse_ts(13, &updated_at)?,
        triggered_at: parse_opt_ts(14, row.get(14)?)?,
        completed_at: parse_opt_ts(15, row.get(15)?)?,
    })
}

fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<IncidentEvent> {
    let event_type: String = row.get(2)?;
    let data: Option<String> = row.get(3)?;
    let created_at: String = row.get(4)?;

    Ok(IncidentEvent {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        event_type: event_type
            .parse()
            .map_err(|err| conversion_error(2, err))?,
        data: data
            .map(|d| serde_json::from_str(&d).map_err(|err| conversion_error(3, err)))
            .transpose()?,
        created_at: parse_ts(4, &created_at)?,
    })
}
