use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relayflow_utils::error::Error;
use relayflow_utils::FlowResult;
use rusqlite::types::Type;
use rusqlite::{params, Connection as SqliteConnection, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

use super::models::{
    Connection, ConnectorRecord, Execution, ExecutionStatus, NewConnection, NewConnector,
};
use crate::schedule::CronSchedule;

/// The store as shared between the engine and orchestration tasks.
pub type SharedStore = Arc<tokio::sync::Mutex<Store>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectorKind {
    Source,
    Destination,
}

impl ConnectorKind {
    fn table(self) -> &'static str {
        match self {
            ConnectorKind::Source => "sources",
            ConnectorKind::Destination => "destinations",
        }
    }

    fn label(self) -> &'static str {
        match self {
            ConnectorKind::Source => "source",
            ConnectorKind::Destination => "destination",
        }
    }
}

/// SQLite-backed store for connections, their connectors, and orchestration
/// executions.
pub struct Store {
    conn: SqliteConnection,
}

impl Store {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: impl AsRef<Path>) -> FlowResult<Self> {
        let store = Self {
            conn: SqliteConnection::open(path)?,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn in_memory() -> FlowResult<Self> {
        let store = Self {
            conn: SqliteConnection::open_in_memory()?,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    fn migrate(&self) -> FlowResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                credentials TEXT NOT NULL,
                options TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS destinations (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                credentials TEXT NOT NULL,
                options TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS connections (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                destination_id TEXT NOT NULL,
                schedule TEXT NOT NULL,
                run_token TEXT,
                last_ran_at TEXT,
                execution_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                connection_id TEXT NOT NULL,
                restart_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                action TEXT NOT NULL,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
            CREATE INDEX IF NOT EXISTS idx_executions_connection ON executions(connection_id);",
        )?;
        Ok(())
    }

    // -- connections ------------------------------------------------------

    pub fn create_connection(&self, new: NewConnection) -> FlowResult<Connection> {
        CronSchedule::parse(&new.schedule)?;
        let connection = Connection {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            source_id: new.source_id,
            destination_id: new.destination_id,
            schedule: new.schedule,
            run_token: None,
            last_ran_at: None,
            execution_id: None,
            created_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO connections (id, source_id, destination_id, schedule, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                connection.id,
                connection.source_id,
                connection.destination_id,
                connection.schedule,
                connection.created_at
            ],
        )?;
        Ok(connection)
    }

    pub fn get_connection(&self, id: &str) -> FlowResult<Option<Connection>> {
        let connection = self
            .conn
            .query_row(
                "SELECT id, source_id, destination_id, schedule, run_token, last_ran_at,
                        execution_id, created_at
                 FROM connections WHERE id = ?1",
                params![id],
                connection_from_row,
            )
            .optional()?;
        Ok(connection)
    }

    pub fn list_connections(&self) -> FlowResult<Vec<Connection>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, source_id, destination_id, schedule, run_token, last_ran_at,
                    execution_id, created_at
             FROM connections ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], connection_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Replace the user-editable fields. Never touches the run token.
    pub fn update_connection(&self, connection: &Connection) -> FlowResult<()> {
        CronSchedule::parse(&connection.schedule)?;
        let changed = self.conn.execute(
            "UPDATE connections SET source_id = ?2, destination_id = ?3, schedule = ?4
             WHERE id = ?1",
            params![
                connection.id,
                connection.source_id,
                connection.destination_id,
                connection.schedule
            ],
        )?;
        if changed == 0 {
            return Err(Error::Conflict(format!(
                "connection {} does not exist",
                connection.id
            )));
        }
        Ok(())
    }

    /// Delete a connection. An in-flight run is not cancelled; it notices on
    /// its next wake-up.
    pub fn delete_connection(&self, id: &str) -> FlowResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM connections WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Take the run token if nobody holds it. A single conditional write, so
    /// two concurrent callers can never both succeed.
    pub fn reserve(&self, id: &str) -> FlowResult<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let changed = self.conn.execute(
            "UPDATE connections SET run_token = ?2 WHERE id = ?1 AND run_token IS NULL",
            params![id, token],
        )?;
        let granted = changed == 1;
        crate::metrics::inc_reservation(granted);
        Ok(granted.then_some(token))
    }

    /// Release the run token and stamp `last_ran_at`.
    pub fn finish(&self, id: &str) -> FlowResult<DateTime<Utc>> {
        self.finish_at(id, Utc::now())
    }

    pub fn finish_at(&self, id: &str, at: DateTime<Utc>) -> FlowResult<DateTime<Utc>> {
        let changed = self.conn.execute(
            "UPDATE connections SET run_token = NULL, last_ran_at = ?2
             WHERE id = ?1 AND run_token IS NOT NULL",
            params![id, at],
        )?;
        self.require_released(id, changed)?;
        Ok(at)
    }

    /// Release the run token without recording a run.
    pub fn abort(&self, id: &str) -> FlowResult<()> {
        let changed = self.conn.execute(
            "UPDATE connections SET run_token = NULL WHERE id = ?1 AND run_token IS NOT NULL",
            params![id],
        )?;
        self.require_released(id, changed)
    }

    fn require_released(&self, id: &str, changed: usize) -> FlowResult<()> {
        if changed > 0 {
            return Ok(());
        }
        match self.get_connection(id)? {
            Some(_) => Err(Error::Conflict(format!("connection {id} holds no run token"))),
            None => Err(Error::NotFound(format!("connection {id}"))),
        }
    }

    // -- sources & destinations -------------------------------------------

    pub fn create_source(&self, new: NewConnector) -> FlowResult<ConnectorRecord> {
        self.insert_connector(ConnectorKind::Source, new)
    }

    pub fn get_source(&self, id: &str) -> FlowResult<Option<ConnectorRecord>> {
        self.get_connector(ConnectorKind::Source, id)
    }

    pub fn list_sources(&self) -> FlowResult<Vec<ConnectorRecord>> {
        self.list_connectors(ConnectorKind::Source)
    }

    pub fn update_source(&self, record: &ConnectorRecord) -> FlowResult<()> {
        self.update_connector(ConnectorKind::Source, record)
    }

    pub fn delete_source(&self, id: &str) -> FlowResult<bool> {
        self.delete_connector(ConnectorKind::Source, id)
    }

    pub fn create_destination(&self, new: NewConnector) -> FlowResult<ConnectorRecord> {
        self.insert_connector(ConnectorKind::Destination, new)
    }

    pub fn get_destination(&self, id: &str) -> FlowResult<Option<ConnectorRecord>> {
        self.get_connector(ConnectorKind::Destination, id)
    }

    pub fn list_destinations(&self) -> FlowResult<Vec<ConnectorRecord>> {
        self.list_connectors(ConnectorKind::Destination)
    }

    pub fn update_destination(&self, record: &ConnectorRecord) -> FlowResult<()> {
        self.update_connector(ConnectorKind::Destination, record)
    }

    pub fn delete_destination(&self, id: &str) -> FlowResult<bool> {
        self.delete_connector(ConnectorKind::Destination, id)
    }

    fn insert_connector(&self, kind: ConnectorKind, new: NewConnector) -> FlowResult<ConnectorRecord> {
        let record = ConnectorRecord {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            provider: new.provider,
            credentials: new.credentials,
            options: new.options,
            created_at: Utc::now(),
        };
        self.conn.execute(
            &format!(
                "INSERT INTO {} (id, provider, credentials, options, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                kind.table()
            ),
            params![
                record.id,
                record.provider,
                serde_json::to_string(&record.credentials)?,
                serde_json::to_string(&record.options)?,
                record.created_at
            ],
        )?;
        Ok(record)
    }

    fn get_connector(&self, kind: ConnectorKind, id: &str) -> FlowResult<Option<ConnectorRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, provider, credentials, options, created_at FROM {} WHERE id = ?1",
                    kind.table()
                ),
                params![id],
                connector_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn list_connectors(&self, kind: ConnectorKind) -> FlowResult<Vec<ConnectorRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, provider, credentials, options, created_at FROM {} ORDER BY created_at",
            kind.table()
        ))?;
        let rows = stmt.query_map([], connector_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn update_connector(&self, kind: ConnectorKind, record: &ConnectorRecord) -> FlowResult<()> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET provider = ?2, credentials = ?3, options = ?4 WHERE id = ?1",
                kind.table()
            ),
            params![
                record.id,
                record.provider,
                serde_json::to_string(&record.credentials)?,
                serde_json::to_string(&record.options)?
            ],
        )?;
        if changed == 0 {
            return Err(Error::Conflict(format!(
                "{} {} does not exist",
                kind.label(),
                record.id
            )));
        }
        Ok(())
    }

    fn delete_connector(&self, kind: ConnectorKind, id: &str) -> FlowResult<bool> {
        let changed = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
            params![id],
        )?;
        Ok(changed > 0)
    }

    // -- executions -------------------------------------------------------

    /// Record a new running execution and point its connection at it, in
    /// one transaction. Fails with `NotFound` when the connection is gone.
    pub fn start_execution(
        &self,
        id: &str,
        connection_id: &str,
        restart_count: u32,
        action: &Value,
    ) -> FlowResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE connections SET execution_id = ?2 WHERE id = ?1",
            params![connection_id, id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("connection {connection_id}")));
        }
        let now = Utc::now();
        tx.execute(
            "INSERT INTO executions (id, connection_id, restart_count, status, action, started_at, updated_at)
             VALUES (?1, ?2, ?3, 'running', ?4, ?5, ?5)",
            params![id, connection_id, restart_count, serde_json::to_string(action)?, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Persist the envelope an execution is about to act on.
    pub fn save_action(&self, id: &str, action: &Value) -> FlowResult<()> {
        let changed = self.conn.execute(
            "UPDATE executions SET action = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, serde_json::to_string(action)?, Utc::now()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("execution {id}")));
        }
        Ok(())
    }

    pub fn complete_execution(&self, id: &str) -> FlowResult<()> {
        self.set_execution_status(id, ExecutionStatus::Completed, None)
    }

    pub fn fail_execution(&self, id: &str, error: &str) -> FlowResult<()> {
        self.set_execution_status(id, ExecutionStatus::Failed, Some(error))
    }

    fn set_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> FlowResult<()> {
        self.conn.execute(
            "UPDATE executions SET status = ?2, error = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, status.as_str(), error, Utc::now()],
        )?;
        Ok(())
    }

    pub fn get_execution(&self, id: &str) -> FlowResult<Option<Execution>> {
        let execution = self
            .conn
            .query_row(
                "SELECT id, connection_id, restart_count, status, action, started_at, updated_at, error
                 FROM executions WHERE id = ?1",
                params![id],
                execution_from_row,
            )
            .optional()?;
        Ok(execution)
    }

    /// Executions still marked running, oldest first; candidates for resume.
    pub fn pending_executions(&self) -> FlowResult<Vec<Execution>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, connection_id, restart_count, status, action, started_at, updated_at, error
             FROM executions WHERE status = 'running' ORDER BY started_at",
        )?;
        let rows = stmt.query_map([], execution_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn executions_for(&self, connection_id: &str) -> FlowResult<Vec<Execution>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, connection_id, restart_count, status, action, started_at, updated_at, error
             FROM executions WHERE connection_id = ?1 ORDER BY restart_count, started_at",
        )?;
        let rows = stmt.query_map(params![connection_id], execution_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<Connection> {
    Ok(Connection {
        id: row.get(0)?,
        source_id: row.get(1)?,
        destination_id: row.get(2)?,
        schedule: row.get(3)?,
        run_token: row.get(4)?,
        last_ran_at: row.get(5)?,
        execution_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn connector_from_row(row: &Row<'_>) -> rusqlite::Result<ConnectorRecord> {
    Ok(ConnectorRecord {
        id: row.get(0)?,
        provider: row.get(1)?,
        credentials: json_column(row, 2)?,
        options: json_column(row, 3)?,
        created_at: row.get(4)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(3)?;
    let status = ExecutionStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown execution status '{status}'").into(),
        )
    })?;
    Ok(Execution {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        restart_count: row.get(2)?,
        status,
        action: json_column(row, 4)?,
        started_at: row.get(5)?,
        updated_at: row.get(6)?,
        error: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_connection() -> (Store, Connection) {
        let store = Store::in_memory().unwrap();
        let connection = store
            .create_connection(NewConnection {
                id: None,
                source_id: "src".into(),
                destination_id: "dst".into(),
                schedule: "*/5 * * * *".into(),
            })
            .unwrap();
        (store, connection)
    }

    #[test]
    fn reserve_grants_once() {
        let (store, connection) = store_with_connection();

        let token = store.reserve(&connection.id).unwrap();
        assert!(token.is_some());
        let stored = store.get_connection(&connection.id).unwrap().unwrap();
        assert_eq!(stored.run_token, token);

        assert_eq!(store.reserve(&connection.id).unwrap(), None);
        let still = store.get_connection(&connection.id).unwrap().unwrap();
        assert_eq!(still.run_token, token);
    }

    #[test]
    fn reserve_on_missing_connection_is_denied() {
        let store = Store::in_memory().unwrap();
        assert_eq!(store.reserve("nope").unwrap(), None);
    }

    #[test]
    fn finish_clears_token_and_stamps_last_ran() {
        let (store, connection) = store_with_connection();
        let before = Utc::now();
        store.reserve(&connection.id).unwrap().unwrap();

        store.finish(&connection.id).unwrap();

        let stored = store.get_connection(&connection.id).unwrap().unwrap();
        assert_eq!(stored.run_token, None);
        assert!(stored.last_ran_at.unwrap() >= before);
    }

    #[test]
    fn finish_without_reservation_is_a_conflict_and_a_no_op() {
        let (store, connection) = store_with_connection();

        let err = store.finish(&connection.id).unwrap_err();
        assert!(err.is_conflict());
        let stored = store.get_connection(&connection.id).unwrap().unwrap();
        assert_eq!(stored.last_ran_at, None);

        assert!(store.finish("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn abort_releases_without_stamping() {
        let (store, connection) = store_with_connection();
        store.reserve(&connection.id).unwrap().unwrap();

        store.abort(&connection.id).unwrap();
        let stored = store.get_connection(&connection.id).unwrap().unwrap();
        assert_eq!(stored.run_token, None);
        assert_eq!(stored.last_ran_at, None);

        assert!(store.abort(&connection.id).unwrap_err().is_conflict());
    }

    #[test]
    fn update_requires_existence() {
        let (store, mut connection) = store_with_connection();
        connection.schedule = "0 * * * *".into();
        store.update_connection(&connection).unwrap();
        assert_eq!(
            store.get_connection(&connection.id).unwrap().unwrap().schedule,
            "0 * * * *"
        );

        connection.id = "ghost".into();
        assert!(store.update_connection(&connection).unwrap_err().is_conflict());
    }

    #[test]
    fn invalid_schedule_is_rejected() {
        let store = Store::in_memory().unwrap();
        let err = store
            .create_connection(NewConnection {
                id: Some("c".into()),
                source_id: "s".into(),
                destination_id: "d".into(),
                schedule: "every tuesday".into(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule { .. }));
    }

    #[test]
    fn delete_and_list_connections() {
        let (store, connection) = store_with_connection();
        assert_eq!(store.list_connections().unwrap().len(), 1);
        assert!(store.delete_connection(&connection.id).unwrap());
        assert!(!store.delete_connection(&connection.id).unwrap());
        assert!(store.get_connection(&connection.id).unwrap().is_none());
    }

    #[test]
    fn connector_records_round_trip_json() {
        let store = Store::in_memory().unwrap();
        let source = store
            .create_source(NewConnector {
                id: Some("gh".into()),
                provider: "github".into(),
                credentials: json!({"provider": "vault", "path": "kv/gh"}),
                options: json!({"org": "acme"}),
            })
            .unwrap();
        let loaded = store.get_source("gh").unwrap().unwrap();
        assert_eq!(loaded, source);

        let mut changed = loaded.clone();
        changed.options = json!({"org": "other"});
        store.update_source(&changed).unwrap();
        assert_eq!(store.get_source("gh").unwrap().unwrap().options["org"], "other");

        assert!(store.get_destination("gh").unwrap().is_none());
        assert_eq!(store.list_sources().unwrap().len(), 1);
        assert!(store.delete_source("gh").unwrap());

        let missing = ConnectorRecord { id: "x".into(), ..changed };
        assert!(store.update_destination(&missing).unwrap_err().is_conflict());
    }

    #[test]
    fn executions_track_actions_and_status() {
        let (store, connection) = store_with_connection();
        store
            .start_execution("e1", &connection.id, 0, &json!({"action": "BEFORE_SYNC"}))
            .unwrap();
        store
            .start_execution("e2", &connection.id, 1, &json!({"action": "BEFORE_SYNC"}))
            .unwrap();
        store.save_action("e1", &json!({"action": "AFTER_SYNC"})).unwrap();
        store.complete_execution("e2").unwrap();

        let pending = store.pending_executions().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "e1");
        assert_eq!(pending[0].action["action"], "AFTER_SYNC");

        store.fail_execution("e1", "boom").unwrap();
        let failed = store.get_execution("e1").unwrap().unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(store.pending_executions().unwrap().is_empty());

        assert_eq!(store.executions_for(&connection.id).unwrap().len(), 2);
        assert!(store.save_action("missing", &json!({})).unwrap_err().is_not_found());
    }

    #[test]
    fn start_execution_points_connection_at_it() {
        let (store, connection) = store_with_connection();
        store
            .start_execution("exec-9", &connection.id, 2, &json!({"action": "BEFORE_SYNC"}))
            .unwrap();
        let stored = store.get_connection(&connection.id).unwrap().unwrap();
        assert_eq!(stored.execution_id.as_deref(), Some("exec-9"));
        let execution = store.get_execution("exec-9").unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(execution.restart_count, 2);

        let err = store
            .start_execution("exec-10", "missing", 0, &json!({"action": "BEFORE_SYNC"}))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get_execution("exec-10").unwrap().is_none());
    }
}
