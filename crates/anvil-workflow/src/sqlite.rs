//! SQLite storage backend
//!
//! WAL mode gives concurrent readers with serialized writes. Records,
//! action lists and events are JSON with indexed lookup columns; the
//! context row carries a `version` column that every transition
//! compare-and-swaps, so two servers sharing a database cannot lose an
//! update.

use crate::error::StoreError;
use crate::store::{Result, VersionedContext, WorkflowStore};
use anvil_crd::{
    ActionState, ActionStatusReport, Hardware, Template, WorkflowAction, WorkflowContext,
    WorkflowData, WorkflowRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS templates (
        name TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hardware (
        name TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow (
        id TEXT PRIMARY KEY,
        template_ref TEXT NOT NULL,
        hardware_ref TEXT,
        record TEXT NOT NULL,
        actions TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_state (
        workflow_id TEXT PRIMARY KEY,
        current_worker TEXT NOT NULL,
        current_task TEXT NOT NULL,
        current_action TEXT NOT NULL,
        current_action_state TEXT NOT NULL,
        current_action_index INTEGER NOT NULL,
        total_number_of_actions INTEGER NOT NULL,
        version INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_state_worker ON workflow_state(current_worker)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_event (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_id TEXT NOT NULL,
        action_state TEXT NOT NULL,
        data TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_event_workflow ON workflow_event(workflow_id)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_data (
        workflow_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        metadata TEXT NOT NULL,
        data BLOB NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (workflow_id, version)
    )
    "#,
];

fn db(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(db)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(d) if d.is_unique_violation())
}

/// SQLite storage backend
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(db)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(db)?;

        let store = Self { pool };
        store.create_tables().await?;
        info!("SQLite store opened at {}", path_str);
        Ok(store)
    }

    async fn create_tables(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(db)?;
        }
        Ok(())
    }

    fn context_from_row(row: &SqliteRow) -> Result<VersionedContext> {
        let state: String = column(row, "current_action_state")?;
        let current_action_state = ActionState::from_str_name(&state)
            .ok_or_else(|| StoreError::Serialization(format!("unknown action state {}", state)))?;
        let index: i64 = column(row, "current_action_index")?;
        let total: i64 = column(row, "total_number_of_actions")?;
        let version: i64 = column(row, "version")?;

        Ok(VersionedContext {
            context: WorkflowContext {
                workflow_id: column(row, "workflow_id")?,
                current_worker: column(row, "current_worker")?,
                current_task: column(row, "current_task")?,
                current_action: column(row, "current_action")?,
                current_action_state,
                current_action_index: index as usize,
                total_number_of_actions: total as usize,
            },
            version: version as u64,
        })
    }

    fn data_from_row(row: &SqliteRow) -> Result<WorkflowData> {
        let version: i64 = column(row, "version")?;
        let metadata: String = column(row, "metadata")?;
        let created_at: String = column(row, "created_at")?;
        Ok(WorkflowData {
            workflow_id: column(row, "workflow_id")?,
            version: version as u32,
            metadata: from_json(&metadata)?,
            data: column(row, "data")?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| StoreError::Serialization(e.to_string()))?
                .with_timezone(&Utc),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        key: &str,
        field: &str,
    ) -> Result<Option<T>> {
        let row = sqlx::query(sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        match row {
            Some(row) => {
                let json: String = column(&row, field)?;
                Ok(Some(from_json(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn list_json<T: serde::de::DeserializeOwned>(&self, sql: &str, field: &str) -> Result<Vec<T>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await.map_err(db)?;
        rows.iter()
            .map(|row| {
                let json: String = column(row, field)?;
                from_json(&json)
            })
            .collect()
    }

    async fn delete_by_key(&self, sql: &str, key: &str) -> Result<bool> {
        let result = sqlx::query(sql)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn get_template(&self, name: &str) -> Result<Option<Template>> {
        self.get_json("SELECT data FROM templates WHERE name = ?", name, "data")
            .await
    }

    async fn put_template(&self, template: &Template) -> Result<()> {
        sqlx::query(
            "INSERT INTO templates (name, data) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET data = excluded.data",
        )
        .bind(&template.metadata.name)
        .bind(to_json(template)?)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        self.list_json("SELECT data FROM templates ORDER BY name", "data")
            .await
    }

    async fn delete_template(&self, name: &str) -> Result<bool> {
        self.delete_by_key("DELETE FROM templates WHERE name = ?", name)
            .await
    }

    async fn get_hardware(&self, name: &str) -> Result<Option<Hardware>> {
        self.get_json("SELECT data FROM hardware WHERE name = ?", name, "data")
            .await
    }

    async fn put_hardware(&self, hardware: &Hardware) -> Result<()> {
        sqlx::query(
            "INSERT INTO hardware (name, data) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET data = excluded.data",
        )
        .bind(&hardware.metadata.name)
        .bind(to_json(hardware)?)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn list_hardware(&self) -> Result<Vec<Hardware>> {
        self.list_json("SELECT data FROM hardware ORDER BY name", "data")
            .await
    }

    async fn delete_hardware(&self, name: &str) -> Result<bool> {
        self.delete_by_key("DELETE FROM hardware WHERE name = ?", name)
            .await
    }

    async fn create_workflow(
        &self,
        record: &WorkflowRecord,
        actions: &[WorkflowAction],
        context: &WorkflowContext,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query(
            "INSERT INTO workflow (id, template_ref, hardware_ref, record, actions) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.template_ref)
        .bind(&record.hardware_ref)
        .bind(to_json(record)?)
        .bind(to_json(&actions)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(record.id.clone())
            } else {
                db(e)
            }
        })?;

        sqlx::query(
            "INSERT INTO workflow_state (workflow_id, current_worker, current_task, \
             current_action, current_action_state, current_action_index, \
             total_number_of_actions, version) VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&context.workflow_id)
        .bind(&context.current_worker)
        .bind(&context.current_task)
        .bind(&context.current_action)
        .bind(context.current_action_state.as_str())
        .bind(context.current_action_index as i64)
        .bind(context.total_number_of_actions as i64)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>> {
        self.get_json("SELECT record FROM workflow WHERE id = ?", id, "record")
            .await
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>> {
        self.list_json("SELECT record FROM workflow ORDER BY rowid", "record")
            .await
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let removed = sqlx::query("DELETE FROM workflow WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db)?
            .rows_affected();
        for sql in [
            "DELETE FROM workflow_state WHERE workflow_id = ?",
            "DELETE FROM workflow_event WHERE workflow_id = ?",
            "DELETE FROM workflow_data WHERE workflow_id = ?",
        ] {
            sqlx::query(sql)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }

        tx.commit().await.map_err(db)?;
        Ok(removed > 0)
    }

    async fn get_actions(&self, id: &str) -> Result<Option<Vec<WorkflowAction>>> {
        self.get_json("SELECT actions FROM workflow WHERE id = ?", id, "actions")
            .await
    }

    async fn get_context(&self, id: &str) -> Result<Option<VersionedContext>> {
        let row = sqlx::query("SELECT * FROM workflow_state WHERE workflow_id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(Self::context_from_row).transpose()
    }

    async fn list_contexts(&self) -> Result<Vec<WorkflowContext>> {
        let rows = sqlx::query(
            "SELECT s.* FROM workflow_state s JOIN workflow w ON w.id = s.workflow_id \
             ORDER BY w.rowid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter()
            .map(|row| Self::context_from_row(row).map(|v| v.context))
            .collect()
    }

    async fn commit_transition(
        &self,
        expected_version: u64,
        context: &WorkflowContext,
        event: &ActionStatusReport,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let updated = sqlx::query(
            "UPDATE workflow_state SET current_worker = ?, current_task = ?, \
             current_action = ?, current_action_state = ?, current_action_index = ?, \
             version = version + 1 WHERE workflow_id = ? AND version = ?",
        )
        .bind(&context.current_worker)
        .bind(&context.current_task)
        .bind(&context.current_action)
        .bind(context.current_action_state.as_str())
        .bind(context.current_action_index as i64)
        .bind(&context.workflow_id)
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await
        .map_err(db)?
        .rows_affected();

        if updated == 0 {
            let exists = sqlx::query("SELECT version FROM workflow_state WHERE workflow_id = ?")
                .bind(&context.workflow_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db)?;
            return Err(match exists {
                Some(_) => StoreError::Conflict {
                    workflow_id: context.workflow_id.clone(),
                    expected: expected_version,
                },
                None => StoreError::NotFound(context.workflow_id.clone()),
            });
        }

        sqlx::query("INSERT INTO workflow_event (workflow_id, action_state, data) VALUES (?, ?, ?)")
            .bind(&event.workflow_id)
            .bind(event.action_state.as_str())
            .bind(to_json(event)?)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(expected_version + 1)
    }

    async fn list_events(&self, id: &str) -> Result<Vec<ActionStatusReport>> {
        let rows = sqlx::query("SELECT data FROM workflow_event WHERE workflow_id = ? ORDER BY id")
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(|row| {
                let json: String = column(row, "data")?;
                from_json(&json)
            })
            .collect()
    }

    async fn put_data(
        &self,
        id: &str,
        metadata: &serde_json::Value,
        data: &[u8],
    ) -> Result<WorkflowData> {
        let created_at = Utc::now();

        // One statement, so the write lock is taken before the version is read
        let row = sqlx::query(
            "INSERT INTO workflow_data (workflow_id, version, metadata, data, created_at) \
             SELECT w.id, \
                    (SELECT COALESCE(MAX(d.version), 0) + 1 FROM workflow_data d \
                     WHERE d.workflow_id = w.id), \
                    ?, ?, ? \
             FROM workflow w WHERE w.id = ? \
             RETURNING version",
        )
        .bind(to_json(metadata)?)
        .bind(data)
        .bind(created_at.to_rfc3339())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict {
                    workflow_id: id.to_string(),
                    expected: 0,
                }
            } else {
                db(e)
            }
        })?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let version: i64 = column(&row, "version")?;
        Ok(WorkflowData {
            workflow_id: id.to_string(),
            version: version as u32,
            metadata: metadata.clone(),
            data: data.to_vec(),
            created_at,
        })
    }

    async fn get_data(&self, id: &str, version: u32) -> Result<Option<WorkflowData>> {
        let row = if version == 0 {
            sqlx::query(
                "SELECT * FROM workflow_data WHERE workflow_id = ? ORDER BY version DESC LIMIT 1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        } else {
            sqlx::query("SELECT * FROM workflow_data WHERE workflow_id = ? AND version = ?")
                .bind(id)
                .bind(version as i64)
                .fetch_optional(&self.pool)
                .await
        }
        .map_err(db)?;
        row.as_ref().map(Self::data_from_row).transpose()
    }

    async fn latest_data_version(&self, id: &str) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS latest FROM workflow_data WHERE workflow_id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        let latest: i64 = column(&row, "latest")?;
        Ok(latest as u32)
    }
}
