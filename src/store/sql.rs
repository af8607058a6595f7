//! SQL-backed store for SQLite and Postgres.
//!
//! Both backends go through sqlx's `Any` driver; the [`Dialect`] only
//! changes DDL, placeholders, and row locking. A claim is one transaction:
//! stamp up to `n` unclaimed rows with a fresh lock token, read them back
//! by token, delete them by token.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::Store;
use crate::config::StoreSpec;
use crate::config::secrets::{ExposeSecret, SecretString};
use crate::error::{Error, Result};
use crate::model::{Claim, LockToken, Order, PutOutcome, Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Guess the dialect from a connection URL.
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("sqlite:") {
            Some(Dialect::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Some(Dialect::Postgres)
        } else {
            None
        }
    }

    /// Bind parameter `n`, 1-based.
    fn param(self, n: usize) -> String {
        match self {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${n}"),
        }
    }

    fn create_table(self, table: &str) -> String {
        let (added, priority) = match self {
            Dialect::Sqlite => ("INTEGER PRIMARY KEY AUTOINCREMENT", "REAL"),
            Dialect::Postgres => ("BIGSERIAL PRIMARY KEY", "DOUBLE PRECISION"),
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                added    {added},
                id       TEXT NOT NULL UNIQUE,
                lock     TEXT NOT NULL DEFAULT '',
                task     TEXT NOT NULL,
                priority {priority} NOT NULL DEFAULT 1.0
            )"
        )
    }

    fn row_lock(self) -> &'static str {
        match self {
            Dialect::Sqlite => "",
            Dialect::Postgres => " FOR UPDATE SKIP LOCKED",
        }
    }
}

pub struct SqlStore {
    url: SecretString,
    dialect: Dialect,
    table: String,
    pool: OnceCell<AnyPool>,
}

impl std::fmt::Debug for SqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlStore")
            .field("dialect", &self.dialect)
            .field("table", &self.table)
            .field("connected", &self.pool.initialized())
            .finish()
    }
}

impl SqlStore {
    pub fn new(url: SecretString, dialect: Dialect, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table(&table)?;
        Ok(Self {
            url,
            dialect,
            table,
            pool: OnceCell::new(),
        })
    }

    /// Build from a store spec. SQLite falls back to `path`, then to an
    /// in-memory database; Postgres needs a URL.
    pub fn from_spec(spec: &StoreSpec, dialect: Dialect) -> Result<Self> {
        let url = match (&spec.url, dialect) {
            (Some(url), _) => SecretString::from(url.expose_secret().to_string()),
            (None, Dialect::Sqlite) => SecretString::from(match &spec.path {
                Some(path) => format!("sqlite://{path}?mode=rwc"),
                None => "sqlite::memory:".to_string(),
            }),
            (None, Dialect::Postgres) => {
                return Err(Error::Config("postgres store requires a url".into()));
            }
        };
        Self::new(url, dialect, spec.table.clone())
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn pool(&self) -> Result<&AnyPool> {
        self.pool.get().ok_or(Error::NotConnected)
    }

    async fn open(&self) -> Result<AnyPool> {
        sqlx::any::install_default_drivers();
        let url = self.url.expose_secret();
        let options = match self.dialect {
            // One connection: an in-memory database lives and dies with it,
            // and a file database serializes writers anyway.
            Dialect::Sqlite => AnyPoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>),
            Dialect::Postgres => AnyPoolOptions::new().max_connections(5),
        };
        let pool = options.connect(url).await?;

        sqlx::query(&self.dialect.create_table(&self.table))
            .execute(&pool)
            .await?;
        let index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_claim_idx ON {table} (lock, priority, added)",
            table = self.table
        );
        sqlx::query(&index).execute(&pool).await?;
        Ok(pool)
    }

    async fn take(&self, n: usize, order: Order) -> Result<Claim> {
        let pool = self.pool()?;
        let lock = LockToken::new();
        let token = lock.to_string();
        let direction = match order {
            Order::Fifo => "ASC",
            Order::Filo => "DESC",
        };
        let d = self.dialect;
        let t = &self.table;

        let mut tx = pool.begin().await?;

        let stamp = format!(
            "UPDATE {t} SET lock = {p1} WHERE lock = '' AND id IN (
                SELECT id FROM {t} WHERE lock = ''
                ORDER BY priority DESC, added {direction}
                LIMIT {p2}{row_lock}
            )",
            p1 = d.param(1),
            p2 = d.param(2),
            row_lock = d.row_lock(),
        );
        let stamped = sqlx::query(&stamp)
            .bind(token.clone())
            .bind(n as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if stamped == 0 {
            tx.commit().await?;
            return Ok(Claim {
                lock,
                tasks: Vec::new(),
            });
        }

        let select = format!(
            "SELECT id, task FROM {t} WHERE lock = {p1} ORDER BY priority DESC, added {direction}",
            p1 = d.param(1),
        );
        let rows: Vec<(String, String)> = sqlx::query_as(&select)
            .bind(token.clone())
            .fetch_all(&mut *tx)
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for (id, task) in rows {
            tasks.push((TaskId(id), serde_json::from_str::<Task>(&task)?));
        }

        let delete = format!("DELETE FROM {t} WHERE lock = {p1}", p1 = d.param(1));
        sqlx::query(&delete).bind(token).execute(&mut *tx).await?;
        tx.commit().await?;

        debug!(table = %self.table, lock = %lock, claimed = tasks.len(), "claimed batch");
        Ok(Claim { lock, tasks })
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn connect(&self) -> Result<usize> {
        self.pool.get_or_try_init(|| self.open()).await?;
        let count = self.pending().await?;
        info!(table = %self.table, dialect = ?self.dialect, pending = count, "store connected");
        Ok(count)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let sql = format!(
            "SELECT task FROM {} WHERE id = {} AND lock = ''",
            self.table,
            self.dialect.param(1)
        );
        let row: Option<(String,)> = sqlx::query_as(&sql)
            .bind(id.as_str().to_string())
            .fetch_optional(self.pool()?)
            .await?;
        row.map(|(task,)| serde_json::from_str(&task).map_err(Error::from))
            .transpose()
    }

    async fn put_task(&self, id: &TaskId, task: &Task, priority: f64) -> Result<PutOutcome> {
        let pool = self.pool()?;
        let payload = serde_json::to_string(task)?;
        let d = self.dialect;

        let update = format!(
            "UPDATE {} SET task = {}, priority = {} WHERE id = {} AND lock = ''",
            self.table,
            d.param(1),
            d.param(2),
            d.param(3)
        );
        let updated = sqlx::query(&update)
            .bind(payload.clone())
            .bind(priority)
            .bind(id.as_str().to_string())
            .execute(pool)
            .await?
            .rows_affected();
        if updated > 0 {
            return Ok(PutOutcome::Updated);
        }

        let insert = format!(
            "INSERT INTO {} (id, lock, task, priority) VALUES ({}, '', {}, {})
             ON CONFLICT (id) DO UPDATE SET task = excluded.task, priority = excluded.priority",
            self.table,
            d.param(1),
            d.param(2),
            d.param(3)
        );
        sqlx::query(&insert)
            .bind(id.as_str().to_string())
            .bind(payload)
            .bind(priority)
            .execute(pool)
            .await?;
        Ok(PutOutcome::Inserted)
    }

    async fn take_first_n(&self, n: usize) -> Result<Claim> {
        self.take(n, Order::Fifo).await
    }

    async fn take_last_n(&self, n: usize) -> Result<Claim> {
        self.take(n, Order::Filo).await
    }

    async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE id = {} AND lock = ''",
            self.table,
            self.dialect.param(1)
        );
        let deleted = sqlx::query(&sql)
            .bind(id.as_str().to_string())
            .execute(self.pool()?)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn pending(&self) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE lock = ''", self.table);
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(self.pool()?).await?;
        Ok(count.max(0) as usize)
    }

    async fn close(&self) -> Result<()> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        Ok(())
    }
}

fn validate_table(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid table name: {table:?}")))
    }
}
