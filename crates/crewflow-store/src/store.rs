use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::flow::FlowDefinition;
use crewflow_core::traits::ExecutionStore;
use crewflow_core::types::{
    Checkpoint, Execution, ExecutionId, ExecutionStatus, LogEntry, LogLevel, SpanStatus,
    StatusUpdate, TraceSpan,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        target_id TEXT NOT NULL,
        status TEXT NOT NULL,
        inputs TEXT NOT NULL,
        state TEXT,
        outputs TEXT,
        error TEXT,
        trigger_type TEXT NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        metrics TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_target ON executions(target_id, created_at);

    CREATE TABLE IF NOT EXISTS execution_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        execution_id TEXT NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        source TEXT,
        source_type TEXT,
        data TEXT,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_logs_execution ON execution_logs(execution_id, id);

    CREATE TABLE IF NOT EXISTS trace_spans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        execution_id TEXT NOT NULL,
        trace_id TEXT NOT NULL,
        span_id TEXT NOT NULL,
        parent_span_id TEXT,
        operation_name TEXT NOT NULL,
        operation_type TEXT,
        start_time TEXT NOT NULL,
        end_time TEXT,
        duration_ms INTEGER,
        status TEXT NOT NULL,
        error TEXT,
        attributes TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_spans_execution ON trace_spans(execution_id, id);

    CREATE TABLE IF NOT EXISTS flows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        definition TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS checkpoints (
        execution_id TEXT PRIMARY KEY,
        flow_id TEXT NOT NULL,
        state TEXT NOT NULL,
        traversal TEXT NOT NULL,
        created_at TEXT NOT NULL
    );";

const EXECUTION_COLUMNS: &str = "id, kind, target_id, status, inputs, state, outputs, error, \
     trigger_type, created_at, started_at, completed_at, metrics";

/// SQLite-backed execution store.
///
/// Status writes are a single conditional `UPDATE`, so a transition only
/// lands if the row is still in one of the expected statuses.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CrewflowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CrewflowError::Database(e.to_string()))
    }
}

fn db_err(e: rusqlite::Error) -> CrewflowError {
    CrewflowError::Database(e.to_string())
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_ts)
}

fn parse_json(s: Option<String>) -> Result<Option<Value>> {
    s.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
}

fn to_json(v: Option<&Value>) -> Result<Option<String>> {
    v.map(serde_json::to_string).transpose().map_err(Into::into)
}

/// Raw `executions` row, decoded outside the rusqlite closure.
struct ExecutionRow {
    id: String,
    kind: String,
    target_id: String,
    status: String,
    inputs: String,
    state: Option<String>,
    outputs: Option<String>,
    error: Option<String>,
    trigger_type: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    metrics: String,
}

impl ExecutionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            target_id: row.get(2)?,
            status: row.get(3)?,
            inputs: row.get(4)?,
            state: row.get(5)?,
            outputs: row.get(6)?,
            error: row.get(7)?,
            trigger_type: row.get(8)?,
            created_at: row.get(9)?,
            started_at: row.get(10)?,
            completed_at: row.get(11)?,
            metrics: row.get(12)?,
        })
    }

    fn decode(self) -> Result<Execution> {
        Ok(Execution {
            id: ExecutionId(self.id),
            kind: self.kind.parse().map_err(CrewflowError::Database)?,
            target_id: self.target_id,
            status: self.status.parse().map_err(CrewflowError::Database)?,
            inputs: serde_json::from_str(&self.inputs)?,
            state: parse_json(self.state)?,
            outputs: parse_json(self.outputs)?,
            error: self.error,
            trigger_type: self.trigger_type,
            created_at: parse_ts(&self.created_at),
            started_at: parse_opt_ts(self.started_at),
            completed_at: parse_opt_ts(self.completed_at),
            metrics: serde_json::from_str(&self.metrics)?,
        })
    }
}

fn select_execution(conn: &Connection, id: &str) -> Result<Option<Execution>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
            params![id],
            ExecutionRow::from_row,
        )
        .optional()
        .map_err(db_err)?;
    row.map(ExecutionRow::decode).transpose()
}

impl ExecutionStore for SqliteStore {
    fn insert_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();

        Box::pin(async move {
            let inputs = serde_json::to_string(&execution.inputs)?;
            let state = to_json(execution.state.as_ref())?;
            let outputs = to_json(execution.outputs.as_ref())?;
            let metrics = serde_json::to_string(&execution.metrics)?;

            let conn = self.lock()?;
            conn.execute(
                &format!(
                    "INSERT INTO executions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    EXECUTION_COLUMNS
                ),
                params![
                    execution.id.0,
                    execution.kind.as_str(),
                    execution.target_id,
                    execution.status.as_str(),
                    inputs,
                    state,
                    outputs,
                    execution.error,
                    execution.trigger_type,
                    execution.created_at.to_rfc3339(),
                    execution.started_at.map(|t| t.to_rfc3339()),
                    execution.completed_at.map(|t| t.to_rfc3339()),
                    metrics,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            select_execution(&conn, &id)
        })
    }

    fn update_status(
        &self,
        id: &ExecutionId,
        from: &[ExecutionStatus],
        update: StatusUpdate,
    ) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.0.clone();
        // Status names are fixed identifiers, safe to inline
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        Box::pin(async move {
            if allowed.is_empty() {
                return Ok(None);
            }

            let outputs = to_json(update.outputs.as_ref())?;
            let state = to_json(update.state.as_ref())?;
            let metrics = update
                .metrics
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let now = Utc::now().to_rfc3339();

            let conn = self.lock()?;
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE executions SET
                            status = ?1,
                            error = COALESCE(?2, error),
                            outputs = COALESCE(?3, outputs),
                            state = COALESCE(?4, state),
                            metrics = COALESCE(?5, metrics),
                            started_at = CASE WHEN ?1 = 'running' AND started_at IS NULL
                                THEN ?6 ELSE started_at END,
                            completed_at = CASE WHEN ?1 IN ('completed', 'failed', 'cancelled')
                                THEN ?6 ELSE completed_at END
                         WHERE id = ?7 AND status IN ({})",
                        allowed
                    ),
                    params![
                        update.status.as_str(),
                        update.error,
                        outputs,
                        state,
                        metrics,
                        now,
                        id,
                    ],
                )
                .map_err(db_err)?;

            if changed == 0 {
                return Ok(None);
            }
            select_execution(&conn, &id)
        })
    }

    fn save_state(&self, id: &ExecutionId, state: &Value) -> BoxFuture<'_, Result<()>> {
        let id = id.0.clone();
        let state = state.clone();

        Box::pin(async move {
            let state = serde_json::to_string(&state)?;
            let conn = self.lock()?;
            conn.execute(
                "UPDATE executions SET state = ?1 WHERE id = ?2",
                params![state, id],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn append_log(&self, entry: &LogEntry) -> BoxFuture<'_, Result<()>> {
        let entry = entry.clone();

        Box::pin(async move {
            let data = to_json(entry.data.as_ref())?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO execution_logs
                    (execution_id, level, message, source, source_type, data, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.execution_id.0,
                    entry.level.as_str(),
                    entry.message,
                    entry.source,
                    entry.source_type,
                    data,
                    entry.timestamp.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn list_logs(
        &self,
        id: &ExecutionId,
        level: Option<LogLevel>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<LogEntry>>> {
        let id = id.0.clone();
        let level = level.map(|l| l.as_str());

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT level, message, source, source_type, data, timestamp
                     FROM execution_logs
                     WHERE execution_id = ?1 AND (?2 IS NULL OR level = ?2)
                     ORDER BY id ASC
                     LIMIT ?3",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![id, level, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(db_err)?;

            let mut logs = Vec::new();
            for row in rows {
                let (level, message, source, source_type, data, ts) = row.map_err(db_err)?;
                logs.push(LogEntry {
                    execution_id: ExecutionId(id.clone()),
                    level: level.parse().map_err(CrewflowError::Database)?,
                    message,
                    source,
                    source_type,
                    data: parse_json(data)?,
                    timestamp: parse_ts(&ts),
                });
            }
            Ok(logs)
        })
    }

    fn append_span(&self, span: &TraceSpan) -> BoxFuture<'_, Result<()>> {
        let span = span.clone();

        Box::pin(async move {
            let attributes = serde_json::to_string(&span.attributes)?;
            let status = match span.status {
                SpanStatus::Ok => "ok",
                SpanStatus::Error => "error",
            };
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO trace_spans
                    (execution_id, trace_id, span_id, parent_span_id, operation_name,
                     operation_type, start_time, end_time, duration_ms, status, error, attributes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    span.execution_id.0,
                    span.trace_id,
                    span.span_id,
                    span.parent_span_id,
                    span.operation_name,
                    span.operation_type,
                    span.start_time.to_rfc3339(),
                    span.end_time.map(|t| t.to_rfc3339()),
                    span.duration_ms.map(|d| d as i64),
                    status,
                    span.error,
                    attributes,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn list_spans(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Vec<TraceSpan>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT trace_id, span_id, parent_span_id, operation_name, operation_type,
                            start_time, end_time, duration_ms, status, error, attributes
                     FROM trace_spans
                     WHERE execution_id = ?1
                     ORDER BY id ASC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                })
                .map_err(db_err)?;

            let mut spans = Vec::new();
            for row in rows {
                let (
                    trace_id,
                    span_id,
                    parent_span_id,
                    operation_name,
                    operation_type,
                    start,
                    end,
                    duration_ms,
                    status,
                    error,
                    attributes,
                ) = row.map_err(db_err)?;
                spans.push(TraceSpan {
                    execution_id: ExecutionId(id.clone()),
                    trace_id,
                    span_id,
                    parent_span_id,
                    operation_name,
                    operation_type,
                    start_time: parse_ts(&start),
                    end_time: parse_opt_ts(end),
                    duration_ms: duration_ms.map(|d| d as u64),
                    status: if status == "error" {
                        SpanStatus::Error
                    } else {
                        SpanStatus::Ok
                    },
                    error,
                    attributes: serde_json::from_str(&attributes)?,
                });
            }
            Ok(spans)
        })
    }

    fn save_flow(&self, flow: &FlowDefinition) -> BoxFuture<'_, Result<()>> {
        let flow = flow.clone();

        Box::pin(async move {
            let definition = serde_json::to_string(&flow)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO flows (id, name, definition, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    definition = excluded.definition,
                    updated_at = excluded.updated_at",
                params![flow.id, flow.name, definition, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_flow(&self, flow_id: &str) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let flow_id = flow_id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let definition: Option<String> = conn
                .query_row(
                    "SELECT definition FROM flows WHERE id = ?1",
                    params![flow_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            definition
                .map(|d| serde_json::from_str(&d))
                .transpose()
                .map_err(Into::into)
        })
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let checkpoint = checkpoint.clone();

        Box::pin(async move {
            let state = serde_json::to_string(&checkpoint.state)?;
            let traversal = serde_json::to_string(&checkpoint.traversal)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO checkpoints
                    (execution_id, flow_id, state, traversal, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    checkpoint.execution_id.0,
                    checkpoint.flow_id,
                    state,
                    traversal,
                    checkpoint.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_checkpoint(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    "SELECT flow_id, state, traversal, created_at
                     FROM checkpoints WHERE execution_id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;

            match row {
                Some((flow_id, state, traversal, created_at)) => Ok(Some(Checkpoint {
                    execution_id: ExecutionId(id),
                    flow_id,
                    state: serde_json::from_str(&state)?,
                    traversal: serde_json::from_str(&traversal)?,
                    created_at: parse_ts(&created_at),
                })),
                None => Ok(None),
            }
        })
    }

    fn delete_checkpoint(&self, id: &ExecutionId) -> BoxFuture<'_, Result<()>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "DELETE FROM checkpoints WHERE execution_id = ?1",
                params![id],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewflow_core::flow::{Connection as FlowConnection, Step, StepType};
    use crewflow_core::types::{ExecutionKind, ExecutionMetrics};
    use serde_json::json;

    fn pending() -> Execution {
        let inputs = json!({"topic": "rust"}).as_object().cloned().unwrap();
        Execution::new(ExecutionKind::Flow, "flow-1", inputs, "api")
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = SqliteStore::in_memory().unwrap();
        let exec = pending();
        store.insert_execution(&exec).await.unwrap();

        let loaded = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Pending);
        assert_eq!(loaded.kind, ExecutionKind::Flow);
        assert_eq!(loaded.inputs.get("topic"), Some(&json!("rust")));
        assert!(loaded.started_at.is_none());
        assert!(store
            .get_execution(&ExecutionId::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = SqliteStore::in_memory().unwrap();
        let exec = pending();
        store.insert_execution(&exec).await.unwrap();

        let running = store
            .update_status(
                &exec.id,
                &[ExecutionStatus::Pending],
                StatusUpdate::to(ExecutionStatus::Running),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);
        assert!(running.started_at.is_some());

        // Second writer expecting `pending` loses
        let lost = store
            .update_status(
                &exec.id,
                &[ExecutionStatus::Pending],
                StatusUpdate::to(ExecutionStatus::Cancelled),
            )
            .await
            .unwrap();
        assert!(lost.is_none());

        let done = store
            .update_status(
                &exec.id,
                &[ExecutionStatus::Running],
                StatusUpdate::to(ExecutionStatus::Completed)
                    .with_outputs(json!({"ok": true}))
                    .with_metrics(ExecutionMetrics {
                        total_tokens: 9,
                        ..Default::default()
                    }),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.outputs, Some(json!({"ok": true})));
        assert_eq!(done.metrics.total_tokens, 9);
        assert!(done.completed_at.is_some());
        assert_eq!(done.started_at, running.started_at);
    }

    #[tokio::test]
    async fn test_empty_source_set_never_matches() {
        let store = SqliteStore::in_memory().unwrap();
        let exec = pending();
        store.insert_execution(&exec).await.unwrap();
        let result = store
            .update_status(&exec.id, &[], StatusUpdate::to(ExecutionStatus::Pending))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_logs_filter_and_order() {
        let store = SqliteStore::in_memory().unwrap();
        let id = ExecutionId::new();
        for (level, msg) in [
            (LogLevel::Info, "one"),
            (LogLevel::Error, "two"),
            (LogLevel::Info, "three"),
        ] {
            store
                .append_log(&LogEntry {
                    execution_id: id.clone(),
                    level,
                    message: msg.into(),
                    source: None,
                    source_type: Some("system".into()),
                    data: Some(json!({"n": msg})),
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }

        let all = store.list_logs(&id, None, 100).await.unwrap();
        let messages: Vec<_> = all.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two", "three"]);

        let errors = store.list_logs(&id, Some(LogLevel::Error), 100).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].data, Some(json!({"n": "two"})));

        assert_eq!(store.list_logs(&id, None, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_spans_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let id = ExecutionId::new();
        store
            .append_span(&TraceSpan {
                execution_id: id.clone(),
                trace_id: id.0.clone(),
                span_id: "abc".into(),
                parent_span_id: None,
                operation_name: "step:a".into(),
                operation_type: Some("step".into()),
                start_time: Utc::now(),
                end_time: Some(Utc::now()),
                duration_ms: Some(3),
                status: SpanStatus::Error,
                error: Some("boom".into()),
                attributes: json!({"step_id": "a"}),
            })
            .await
            .unwrap();

        let spans = store.list_spans(&id).await.unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, SpanStatus::Error);
        assert_eq!(spans[0].duration_ms, Some(3));
        assert_eq!(spans[0].attributes["step_id"], "a");
    }

    #[tokio::test]
    async fn test_flows_and_checkpoints() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = FlowDefinition {
            id: "f1".into(),
            name: "demo".into(),
            description: None,
            persistence_enabled: true,
            steps: vec![
                Step::new("start", StepType::Start),
                Step::new("end", StepType::End),
            ],
            connections: vec![FlowConnection::new("start", "end")],
        };
        store.save_flow(&flow).await.unwrap();
        let mut renamed = flow.clone();
        renamed.name = "renamed".into();
        store.save_flow(&renamed).await.unwrap();
        let loaded = store.load_flow("f1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "renamed");
        assert_eq!(loaded.steps.len(), 2);
        assert!(store.load_flow("nope").await.unwrap().is_none());

        let id = ExecutionId::new();
        store
            .save_checkpoint(&Checkpoint {
                execution_id: id.clone(),
                flow_id: "f1".into(),
                state: json!({"k": 1}),
                traversal: json!({"suspended_at": "ask"}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let cp = store.load_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(cp.traversal["suspended_at"], "ask");
        store.delete_checkpoint(&id).await.unwrap();
        assert!(store.load_checkpoint(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_on_disk_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("crewflow.db");
        let exec = pending();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_execution(&exec).await.unwrap();
            store
                .save_state(&exec.id, &json!({"progress": 2}))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, Some(json!({"progress": 2})));
        assert_eq!(loaded.inputs, exec.inputs);
    }
}
