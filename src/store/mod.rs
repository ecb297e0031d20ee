//! Typed CRUD over the task database. The store speaks to SQLite or
//! PostgreSQL through the `sqlx` any-driver; timestamps are RFC 3339 UTC
//! text so ordering works identically on both providers.

use std::collections::BTreeMap;
use std::sync::Once;

use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::config::DatabaseSettings;
use crate::error::{HyperError, Result};
use crate::task::{Task, EXIT_STATUS_CANCELLED, HOSTNAME, INSTANCE};

static DRIVERS: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Sqlite,
    Postgres,
}

/// Search criteria for operator queries.
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub completed: bool,
    pub remaining: bool,
    pub failed: bool,
    pub tags: Vec<(String, String)>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: AnyPool,
    provider: Provider,
}

impl TaskStore {
    /// Connect to the configured backend. SQLite databases are initialized
    /// automatically; server backends require an explicit `initdb`.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        DRIVERS.call_once(sqlx::any::install_default_drivers);
        let (provider, url, max_connections) = match settings.provider.as_str() {
            "sqlite" => {
                let file = settings
                    .file
                    .clone()
                    .unwrap_or_else(|| ":memory:".to_string());
                let url = if file == ":memory:" {
                    "sqlite::memory:".to_string()
                } else {
                    format!("sqlite://{file}?mode=rwc")
                };
                (Provider::Sqlite, url, 1)
            }
            "postgres" => {
                let url = format!(
                    "postgres://{}:{}@{}:{}/{}",
                    settings.user.clone().unwrap_or_else(|| "hypershell".to_string()),
                    settings.password.clone().unwrap_or_default(),
                    settings.host.clone().unwrap_or_else(|| "localhost".to_string()),
                    settings.port.unwrap_or(5432),
                    settings.schema.clone().unwrap_or_else(|| "hypershell".to_string()),
                );
                (Provider::Postgres, url, 8)
            }
            other => {
                return Err(HyperError::Config(format!(
                    "unsupported database provider: {other}"
                )))
            }
        };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;
        let store = Self { pool, provider };
        if provider == Provider::Sqlite {
            store.init_schema().await?;
        }
        Ok(store)
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Create tables and indices if they do not exist.
    pub async fn init_schema(&self) -> Result<()> {
        for statement in [
            "CREATE TABLE IF NOT EXISTS task (
                id TEXT PRIMARY KEY,
                args TEXT NOT NULL,
                submit_id TEXT NOT NULL,
                submit_host TEXT NOT NULL,
                submit_time TEXT NOT NULL,
                server_id TEXT,
                server_host TEXT,
                schedule_time TEXT,
                client_id TEXT,
                client_host TEXT,
                command TEXT,
                start_time TEXT,
                completion_time TEXT,
                exit_status BIGINT,
                outpath TEXT,
                errpath TEXT,
                attempt BIGINT NOT NULL,
                retried BIGINT NOT NULL,
                waited BIGINT,
                duration BIGINT,
                previous_id TEXT
            )",
            "CREATE TABLE IF NOT EXISTS task_tag (
                task_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (task_id, key)
            )",
            "CREATE TABLE IF NOT EXISTS client (
                id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                server_id TEXT NOT NULL,
                connected_at TEXT NOT NULL,
                disconnected_at TEXT,
                evicted BIGINT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS task_submit_time_index ON task (submit_time)",
            "CREATE INDEX IF NOT EXISTS task_exit_status_index ON task (exit_status)",
            "CREATE INDEX IF NOT EXISTS task_schedule_index ON task (schedule_time, exit_status)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Placeholder for the n-th bind (1-based) in provider syntax.
    fn ph(&self, n: usize) -> String {
        match self.provider {
            Provider::Sqlite => "?".to_string(),
            Provider::Postgres => format!("${n}"),
        }
    }

    /// Comma-separated placeholders for binds [start, start+count).
    fn ph_list(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|n| self.ph(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Batch-insert tasks (with their tags) in one transaction.
    pub async fn insert(&self, tasks: &[Task]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let insert_task = format!(
            "INSERT INTO task (id, args, submit_id, submit_host, submit_time,
                server_id, server_host, schedule_time, client_id, client_host,
                command, start_time, completion_time, exit_status, outpath, errpath,
                attempt, retried, waited, duration, previous_id)
             VALUES ({})",
            self.ph_list(1, 21)
        );
        let insert_tag = format!(
            "INSERT INTO task_tag (task_id, key, value) VALUES ({})",
            self.ph_list(1, 3)
        );
        let mut tx = self.pool.begin().await?;
        for task in tasks {
            sqlx::query(&insert_task)
                .bind(task.id.to_string())
                .bind(&task.args)
                .bind(task.submit_id.to_string())
                .bind(&task.submit_host)
                .bind(task.submit_time.to_rfc3339())
                .bind(task.server_id.map(|id| id.to_string()))
                .bind(task.server_host.clone())
                .bind(task.schedule_time.map(|t| t.to_rfc3339()))
                .bind(task.client_id.map(|id| id.to_string()))
                .bind(task.client_host.clone())
                .bind(task.command.clone())
                .bind(task.start_time.map(|t| t.to_rfc3339()))
                .bind(task.completion_time.map(|t| t.to_rfc3339()))
                .bind(task.exit_status.map(i64::from))
                .bind(task.outpath.clone())
                .bind(task.errpath.clone())
                .bind(i64::from(task.attempt))
                .bind(i64::from(task.retried))
                .bind(task.waited)
                .bind(task.duration)
                .bind(task.previous_id.map(|id| id.to_string()))
                .execute(&mut *tx)
                .await?;
            for (key, value) in &task.tags {
                sqlx::query(&insert_tag)
                    .bind(task.id.to_string())
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        tracing::debug!(count = tasks.len(), "Inserted tasks");
        Ok(())
    }

    /// Atomically claim up to `limit` schedulable tasks: stamp server id,
    /// server host and schedule time within a single transaction. Eager
    /// mode prefers retries over novel work; otherwise strict submit order.
    pub async fn claim_next(&self, limit: usize, eager: bool) -> Result<Vec<Task>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let order = if eager {
            "CASE WHEN previous_id IS NULL THEN 1 ELSE 0 END, submit_time"
        } else {
            "submit_time"
        };
        let locking = match self.provider {
            Provider::Postgres => " FOR UPDATE SKIP LOCKED",
            Provider::Sqlite => "",
        };
        let select = format!(
            "SELECT * FROM task WHERE schedule_time IS NULL ORDER BY {order} LIMIT {}{locking}",
            self.ph(1)
        );
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&select)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(task_from_row(row)?);
        }
        if tasks.is_empty() {
            tx.commit().await?;
            return Ok(tasks);
        }
        let now = Utc::now();
        let update = format!(
            "UPDATE task SET server_id = {}, server_host = {}, schedule_time = {}
             WHERE schedule_time IS NULL AND id IN ({})",
            self.ph(1),
            self.ph(2),
            self.ph(3),
            self.ph_list(4, tasks.len())
        );
        let mut query = sqlx::query(&update)
            .bind(INSTANCE.to_string())
            .bind(HOSTNAME.clone())
            .bind(now.to_rfc3339());
        for task in &tasks {
            query = query.bind(task.id.to_string());
        }
        let stamped = query.execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;
        // rows lost to a concurrent claimer are dropped, never returned twice
        if (stamped as usize) < tasks.len() {
            tracing::warn!(
                lost = tasks.len() - stamped as usize,
                "Concurrent claim overlap"
            );
            tasks.truncate(stamped as usize);
        }
        for task in &mut tasks {
            task.server_id = Some(*INSTANCE);
            task.server_host = Some(HOSTNAME.clone());
            task.schedule_time = Some(now);
        }
        self.load_tags(&mut tasks).await?;
        Ok(tasks)
    }

    async fn load_tags(&self, tasks: &mut [Task]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let select = format!(
            "SELECT task_id, key, value FROM task_tag WHERE task_id IN ({})",
            self.ph_list(1, tasks.len())
        );
        let mut query = sqlx::query(&select);
        for task in tasks.iter() {
            query = query.bind(task.id.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut by_id: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for row in rows {
            let task_id: String = row.try_get("task_id")?;
            let key: String = row.try_get("key")?;
            let value: String = row.try_get("value")?;
            by_id.entry(task_id).or_default().insert(key, value);
        }
        for task in tasks.iter_mut() {
            if let Some(tags) = by_id.remove(&task.id.to_string()) {
                task.tags = tags;
            }
        }
        Ok(())
    }

    /// Record a task outcome. Only rows without an exit status are updated,
    /// so a replayed completion with the same outcome is a no-op and a
    /// conflicting one is surfaced as `false` (first write wins).
    pub async fn complete(&self, task: &Task) -> Result<bool> {
        let update = format!(
            "UPDATE task SET client_id = {}, client_host = {}, command = {},
                start_time = {}, completion_time = {}, exit_status = {},
                outpath = {}, errpath = {}, waited = {}, duration = {}
             WHERE id = {} AND exit_status IS NULL",
            self.ph(1),
            self.ph(2),
            self.ph(3),
            self.ph(4),
            self.ph(5),
            self.ph(6),
            self.ph(7),
            self.ph(8),
            self.ph(9),
            self.ph(10),
            self.ph(11)
        );
        let affected = sqlx::query(&update)
            .bind(task.client_id.map(|id| id.to_string()))
            .bind(task.client_host.clone())
            .bind(task.command.clone())
            .bind(task.start_time.map(|t| t.to_rfc3339()))
            .bind(task.completion_time.map(|t| t.to_rfc3339()))
            .bind(task.exit_status.map(i64::from))
            .bind(task.outpath.clone())
            .bind(task.errpath.clone())
            .bind(task.waited)
            .bind(task.duration)
            .bind(task.id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Attribute dispatched tasks to the confirming client.
    pub async fn attribute(&self, client_id: Uuid, client_host: &str, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let update = format!(
            "UPDATE task SET client_id = {}, client_host = {} WHERE id IN ({})",
            self.ph(1),
            self.ph(2),
            self.ph_list(3, ids.len())
        );
        let mut query = sqlx::query(&update)
            .bind(client_id.to_string())
            .bind(client_host.to_string());
        for id in ids {
            query = query.bind(id.to_string());
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    const REVERT_FIELDS: &'static str = "server_id = NULL, server_host = NULL,
        schedule_time = NULL, client_id = NULL, client_host = NULL,
        command = NULL, start_time = NULL, completion_time = NULL,
        exit_status = NULL, outpath = NULL, errpath = NULL,
        waited = NULL, duration = NULL";

    /// Return scheduled-but-incomplete tasks to the schedulable state.
    pub async fn revert_interrupted(&self) -> Result<u64> {
        let update = format!(
            "UPDATE task SET {} WHERE schedule_time IS NOT NULL AND completion_time IS NULL
                AND exit_status IS NULL",
            Self::REVERT_FIELDS
        );
        Ok(sqlx::query(&update)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    /// Revert in-flight tasks attributed to an evicted client.
    pub async fn revert_orphaned(&self, client_id: Uuid) -> Result<u64> {
        let update = format!(
            "UPDATE task SET {} WHERE client_id = {} AND completion_time IS NULL
                AND exit_status IS NULL",
            Self::REVERT_FIELDS,
            self.ph(1)
        );
        Ok(sqlx::query(&update)
            .bind(client_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    /// Cancel tasks: scheduler will never claim them again.
    pub async fn cancel(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let update = format!(
            "UPDATE task SET schedule_time = {}, exit_status = {} WHERE id IN ({})
                AND exit_status IS NULL",
            self.ph(1),
            self.ph(2),
            self.ph_list(3, ids.len())
        );
        let mut query = sqlx::query(&update)
            .bind(Utc::now().to_rfc3339())
            .bind(i64::from(EXIT_STATUS_CANCELLED));
        for id in ids {
            query = query.bind(id.to_string());
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    /// Permanently remove task rows and their tags.
    pub async fn delete(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let delete_tags = format!(
            "DELETE FROM task_tag WHERE task_id IN ({})",
            self.ph_list(1, ids.len())
        );
        let mut query = sqlx::query(&delete_tags);
        for id in ids {
            query = query.bind(id.to_string());
        }
        query.execute(&mut *tx).await?;
        let delete_tasks = format!(
            "DELETE FROM task WHERE id IN ({})",
            self.ph_list(1, ids.len())
        );
        let mut query = sqlx::query(&delete_tasks);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let removed = query.execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;
        Ok(removed)
    }

    /// Insert retry rows for failed tasks still under the attempt limit,
    /// marking the originals so they are not retried twice. Returns the
    /// number of new attempts inserted.
    pub async fn insert_retries(&self, max_attempts: u32, limit: usize) -> Result<usize> {
        if max_attempts <= 1 || limit == 0 {
            return Ok(0);
        }
        let select = format!(
            "SELECT * FROM task WHERE exit_status IS NOT NULL AND exit_status != 0
                AND exit_status != {} AND attempt < {} AND retried = 0
             ORDER BY completion_time LIMIT {}",
            self.ph(1),
            self.ph(2),
            self.ph(3)
        );
        let rows = sqlx::query(&select)
            .bind(i64::from(EXIT_STATUS_CANCELLED))
            .bind(i64::from(max_attempts))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut failed = Vec::with_capacity(rows.len());
        for row in &rows {
            failed.push(task_from_row(row)?);
        }
        if failed.is_empty() {
            return Ok(0);
        }
        self.load_tags(&mut failed).await?;
        let retries: Vec<Task> = failed.iter().map(Task::retry).collect();
        self.insert(&retries).await?;
        let update = format!(
            "UPDATE task SET retried = 1 WHERE id IN ({})",
            self.ph_list(1, failed.len())
        );
        let mut query = sqlx::query(&update);
        for task in &failed {
            query = query.bind(task.id.to_string());
        }
        query.execute(&self.pool).await?;
        for (original, retry) in failed.iter().zip(&retries) {
            tracing::info!(
                task_id = %original.id,
                retry_id = %retry.id,
                attempt = retry.attempt,
                "Scheduled retry for failed task"
            );
        }
        Ok(retries.len())
    }

    pub async fn fetch(&self, id: Uuid) -> Result<Option<Task>> {
        let select = format!("SELECT * FROM task WHERE id = {}", self.ph(1));
        let row = sqlx::query(&select)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let mut tasks = vec![task_from_row(&row)?];
                self.load_tags(&mut tasks).await?;
                Ok(tasks.pop())
            }
            None => Ok(None),
        }
    }

    pub async fn search(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut clauses = Vec::new();
        if filter.completed {
            clauses.push("exit_status IS NOT NULL".to_string());
        }
        if filter.remaining {
            clauses.push("completion_time IS NULL".to_string());
        }
        if filter.failed {
            clauses.push("exit_status IS NOT NULL AND exit_status != 0".to_string());
        }
        let mut bind_index = 1;
        for _ in &filter.tags {
            clauses.push(format!(
                "id IN (SELECT task_id FROM task_tag WHERE key = {} AND value = {})",
                self.ph(bind_index),
                self.ph(bind_index + 1)
            ));
            bind_index += 2;
        }
        let mut select = "SELECT * FROM task".to_string();
        if !clauses.is_empty() {
            select.push_str(" WHERE ");
            select.push_str(&clauses.join(" AND "));
        }
        select.push_str(" ORDER BY submit_time");
        if let Some(limit) = filter.limit {
            select.push_str(&format!(" LIMIT {limit}"));
        }
        let mut query = sqlx::query(&select);
        for (key, value) in &filter.tags {
            query = query.bind(key).bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(task_from_row(row)?);
        }
        self.load_tags(&mut tasks).await?;
        Ok(tasks)
    }

    /// Operator update of a single mutable column.
    pub async fn update_field(&self, id: Uuid, field: &str, value: &str) -> Result<()> {
        let column = match field {
            "args" | "command" | "outpath" | "errpath" => field,
            "exit_status" => {
                value.parse::<i64>().map_err(|_| {
                    HyperError::Config(format!("expected integer for `{field}`"))
                })?;
                field
            }
            other => {
                return Err(HyperError::Config(format!("field `{other}` is not updatable")))
            }
        };
        let update = format!(
            "UPDATE task SET {column} = {} WHERE id = {}",
            self.ph(1),
            self.ph(2)
        );
        let query = if column == "exit_status" {
            sqlx::query(&update).bind(value.parse::<i64>().unwrap())
        } else {
            sqlx::query(&update).bind(value.to_string())
        };
        let affected = query.bind(id.to_string()).execute(&self.pool).await?;
        if affected.rows_affected() == 0 {
            return Err(HyperError::Config(format!("no task with id {id}")));
        }
        Ok(())
    }

    pub async fn set_tag(&self, id: Uuid, key: &str, value: &str) -> Result<()> {
        let upsert = format!(
            "INSERT INTO task_tag (task_id, key, value) VALUES ({})
             ON CONFLICT (task_id, key) DO UPDATE SET value = {}",
            self.ph_list(1, 3),
            self.ph(4)
        );
        sqlx::query(&upsert)
            .bind(id.to_string())
            .bind(key)
            .bind(value)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn scalar(&self, select: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(select).fetch_one(&self.pool).await?;
        Ok(row.0)
    }

    pub async fn count(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM task").await
    }

    /// Count of tasks not yet complete (including in-flight ones).
    pub async fn count_remaining(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM task WHERE completion_time IS NULL AND exit_status IS NULL")
            .await
    }

    /// Count of tasks scheduled but never completed.
    pub async fn count_interrupted(&self) -> Result<i64> {
        self.scalar(
            "SELECT COUNT(*) FROM task
             WHERE schedule_time IS NOT NULL AND completion_time IS NULL AND exit_status IS NULL",
        )
        .await
    }

    /// Count of failed tasks with no pending or successful retry.
    pub async fn count_failed_final(&self) -> Result<i64> {
        self.scalar(
            "SELECT COUNT(*) FROM task
             WHERE exit_status IS NOT NULL AND exit_status != 0 AND retried = 0",
        )
        .await
    }

    /// Average duration in seconds over the most recently completed tasks.
    pub async fn avg_duration(&self, window: usize) -> Result<Option<f64>> {
        let select = format!(
            "SELECT CAST(AVG(duration) AS REAL) FROM (
                SELECT duration FROM task
                WHERE duration IS NOT NULL
                ORDER BY completion_time DESC LIMIT {window}
            ) AS recent"
        );
        let row = sqlx::query(&select).fetch_one(&self.pool).await?;
        Ok(row.try_get::<Option<f64>, _>(0).unwrap_or(None))
    }

    /// Record a client registration.
    pub async fn register_client(&self, client_id: Uuid, client_host: &str) -> Result<()> {
        let insert = format!(
            "INSERT INTO client (id, host, server_id, connected_at, disconnected_at, evicted)
             VALUES ({}) ON CONFLICT (id) DO NOTHING",
            self.ph_list(1, 6)
        );
        sqlx::query(&insert)
            .bind(client_id.to_string())
            .bind(client_host.to_string())
            .bind(INSTANCE.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(Option::<String>::None)
            .bind(0i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stamp a client departure, flagged when it was evicted.
    pub async fn client_disconnected(&self, client_id: Uuid, evicted: bool) -> Result<()> {
        let update = format!(
            "UPDATE client SET disconnected_at = {}, evicted = {} WHERE id = {}",
            self.ph(1),
            self.ph(2),
            self.ph(3)
        );
        sqlx::query(&update)
            .bind(Utc::now().to_rfc3339())
            .bind(i64::from(evicted))
            .bind(client_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|text| {
        DateTime::parse_from_rfc3339(&text)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| HyperError::Internal(format!("bad timestamp in database: {err}")))
    })
    .transpose()
}

fn parse_uuid(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.map(|text| {
        Uuid::parse_str(&text)
            .map_err(|err| HyperError::Internal(format!("bad uuid in database: {err}")))
    })
    .transpose()
}

fn task_from_row(row: &AnyRow) -> Result<Task> {
    Ok(Task {
        id: parse_uuid(Some(row.try_get::<String, _>("id")?))?.unwrap(),
        args: row.try_get("args")?,
        submit_id: parse_uuid(Some(row.try_get::<String, _>("submit_id")?))?.unwrap(),
        submit_host: row.try_get("submit_host")?,
        submit_time: parse_time(Some(row.try_get::<String, _>("submit_time")?))?.unwrap(),
        server_id: parse_uuid(row.try_get("server_id")?)?,
        server_host: row.try_get("server_host")?,
        schedule_time: parse_time(row.try_get("schedule_time")?)?,
        client_id: parse_uuid(row.try_get("client_id")?)?,
        client_host: row.try_get("client_host")?,
        command: row.try_get("command")?,
        start_time: parse_time(row.try_get("start_time")?)?,
        completion_time: parse_time(row.try_get("completion_time")?)?,
        exit_status: row.try_get::<Option<i64>, _>("exit_status")?.map(|v| v as i32),
        outpath: row.try_get("outpath")?,
        errpath: row.try_get("errpath")?,
        attempt: row.try_get::<i64, _>("attempt")? as i32,
        retried: row.try_get::<i64, _>("retried")? != 0,
        waited: row.try_get("waited")?,
        duration: row.try_get("duration")?,
        previous_id: parse_uuid(row.try_get("previous_id")?)?,
        tags: BTreeMap::new(),
    })
}
