//! Minimal async ORM layer for the test harness (sqlx `Any` driver over
//! PostgreSQL and SQLite)
//!
//! Usage:
//! let db = Db::connect("sqlite::memory:").await?;
//! db.execute("CREATE TABLE ...").await?;
//! db.fetch_all("SELECT ...").await?
use crate::error::{HarnessError, Result};
use log::{debug, info};
pub use sqlx::FromRow;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow, install_default_drivers};
use sqlx::query::QueryAs;
use sqlx::{Any, AnyPool, Executor};
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::runtime::{Handle, RuntimeFlavor};

/// SQL dialect of the connected database, detected from the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Dialect::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else {
            // Only the scheme goes into the error, the rest may hold credentials.
            let scheme = url.split(':').next().unwrap_or_default();
            Err(HarnessError::UnsupportedUrl(scheme.to_string()))
        }
    }
}

/// An async database pool wrapper.
///
/// Besides the pool, a `Db` carries the execution-mode flag that decides
/// whether blocking calls are allowed on it. Steady-state access is async
/// only; blocking calls are reserved for schema maintenance inside a
/// [`SyncGuard`] scope.
pub struct Db {
    pool: AnyPool,
    dialect: Dialect,
    allow_sync: AtomicBool,
    sync_scope: AtomicBool,
    runtime: Handle,
}

impl Db {
    /// Connect to a PostgreSQL or SQLite database at the given URI.
    ///
    /// Must be called from within a tokio runtime; blocking calls later run
    /// on that same runtime.
    pub async fn connect(uri: &str) -> Result<Self> {
        let dialect = Dialect::from_url(uri)?;
        install_default_drivers();
        info!("Connecting to {:?} database", dialect);

        let options = match dialect {
            // A single connection that never idles out keeps `sqlite::memory:` alive.
            Dialect::Sqlite => AnyPoolOptions::new()
                .max_connections(1)
                .idle_timeout(None),
            Dialect::Postgres => AnyPoolOptions::new().max_connections(5),
        };
        let pool = options.connect(uri).await?;
        info!("Connected to {:?} database", dialect);

        Ok(Db {
            pool,
            dialect,
            allow_sync: AtomicBool::new(true),
            sync_scope: AtomicBool::new(false),
            runtime: Handle::current(),
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Whether blocking calls are currently permitted.
    pub fn allow_sync(&self) -> bool {
        self.allow_sync.load(Ordering::SeqCst)
    }

    pub fn set_allow_sync(&self, allow: bool) {
        info!("Blocking access on {:?} database: {}", self.dialect, allow);
        self.allow_sync.store(allow, Ordering::SeqCst);
    }

    /// Execute an arbitrary SQL statement, e.g. DDL, INSERT, UPDATE.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        debug!("Executing SQL: {}", sql);
        let result = self.pool.execute(sql).await;
        match &result {
            Ok(_) => debug!("SQL executed successfully"),
            Err(e) => log::error!("SQL execution failed: {}", e),
        }
        result.map(|_| ()).map_err(HarnessError::from)
    }

    /// Fetch all rows and map to a type implementing `FromRow`.
    pub async fn fetch_all<T: for<'r> FromRow<'r, AnyRow> + Send + Unpin>(
        &self,
        sql: &str,
    ) -> Result<Vec<T>> {
        debug!("Fetching rows with SQL: {}", sql);
        let result = sqlx::query_as(sql).fetch_all(&self.pool).await;
        match &result {
            Ok(rows) => debug!("Fetched {} rows successfully", rows.len()),
            Err(e) => log::error!("Row fetch failed: {}", e),
        }
        result.map_err(HarnessError::from)
    }

    /// Blocking counterpart of [`Db::execute`].
    ///
    /// Refused with [`HarnessError::SyncDisallowed`] unless blocking access
    /// is enabled, normally through [`Manager::allow_sync`].
    pub fn execute_blocking(&self, sql: &str) -> Result<()> {
        if !self.allow_sync() {
            return Err(HarnessError::SyncDisallowed(sql.to_string()));
        }
        self.block_on(self.execute(sql))?
    }

    /// Check the catalog for a table with the given name.
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let sql = match self.dialect {
            Dialect::Postgres => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name::text = $1"
            }
            Dialect::Sqlite => "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = $1",
        };
        debug!("Looking up table `{}`", table);
        let (count,): (i64,) = sqlx::query_as(sql)
            .bind(table.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn close(&self) {
        info!("Closing {:?} database pool", self.dialect);
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn enter_sync_scope(&self) -> Result<bool> {
        self.sync_scope
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| HarnessError::SyncScopeActive)?;
        Ok(self.allow_sync.swap(true, Ordering::SeqCst))
    }

    fn exit_sync_scope(&self, previous: bool) {
        self.allow_sync.store(previous, Ordering::SeqCst);
        self.sync_scope.store(false, Ordering::SeqCst);
    }

    fn block_on<F: Future>(&self, fut: F) -> Result<F::Output> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                Ok(tokio::task::block_in_place(|| handle.block_on(fut)))
            }
            Ok(_) => Err(HarnessError::BlockingUnsupported),
            Err(_) if self.runtime.runtime_flavor() == RuntimeFlavor::MultiThread => {
                Ok(self.runtime.block_on(fut))
            }
            Err(_) => Err(HarnessError::BlockingUnsupported),
        }
    }
}

/// Lifecycle of a [`DatabaseProxy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Uninitialized,
    Bound,
    Closed,
}

#[derive(Default)]
enum Slot {
    #[default]
    Uninitialized,
    Bound(Arc<Db>),
    Closed,
}

/// Forward reference to a [`Db`], bound once the connection settings are known.
#[derive(Default)]
pub struct DatabaseProxy {
    slot: RwLock<Slot>,
}

impl DatabaseProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ProxyState {
        match &*self.slot.read().unwrap_or_else(PoisonError::into_inner) {
            Slot::Uninitialized => ProxyState::Uninitialized,
            Slot::Bound(_) => ProxyState::Bound,
            Slot::Closed => ProxyState::Closed,
        }
    }

    /// Bind the proxy to `db`. Returns the handle it was bound to before, if
    /// any; the caller decides when to close it.
    pub fn initialize(&self, db: Db) -> Option<Arc<Db>> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        match mem::replace(&mut *slot, Slot::Bound(Arc::new(db))) {
            Slot::Bound(previous) => Some(previous),
            Slot::Uninitialized | Slot::Closed => None,
        }
    }

    /// The bound handle.
    pub fn obj(&self) -> Result<Arc<Db>> {
        match &*self.slot.read().unwrap_or_else(PoisonError::into_inner) {
            Slot::Bound(db) => Ok(db.clone()),
            Slot::Uninitialized => Err(HarnessError::Uninitialized),
            Slot::Closed => Err(HarnessError::Closed),
        }
    }

    /// Close the bound handle. A proxy that was never bound, or is already
    /// closed, is left as it is.
    pub async fn close(&self) {
        let bound = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            match mem::take(&mut *slot) {
                Slot::Bound(db) => {
                    *slot = Slot::Closed;
                    Some(db)
                }
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(db) = bound {
            db.close().await;
        }
    }
}

pub trait Model: Sized + Send + Sync {
    fn table_name() -> &'static str;
    fn create_table_sql(dialect: Dialect) -> String;
    /// Columns selected back into the model, in declaration order. The first
    /// one orders [`Manager::get`] lookups.
    fn columns() -> &'static [&'static str];
}

/// Static description of a model's table, registered through `inventory`.
pub struct TableSpec {
    table_name: fn() -> &'static str,
    create_table_sql: fn(Dialect) -> String,
}

impl TableSpec {
    pub const fn of<M: Model>() -> Self {
        TableSpec {
            table_name: M::table_name,
            create_table_sql: M::create_table_sql,
        }
    }

    pub fn name(&self) -> &'static str {
        (self.table_name)()
    }

    pub fn create_table_sql(&self, dialect: Dialect) -> String {
        (self.create_table_sql)(dialect)
    }

    pub fn drop_table_sql(&self) -> String {
        drop_table_sql(self.name())
    }

    /// Create the table unless it already exists.
    pub async fn create_table(&self, db: &Db) -> Result<()> {
        db.execute(&self.create_table_sql(db.dialect())).await?;
        info!("Ensured table `{}` exists", self.name());
        Ok(())
    }

    /// Drop the table if it exists.
    pub async fn drop_table(&self, db: &Db) -> Result<()> {
        db.execute(&self.drop_table_sql()).await?;
        info!("Dropped table `{}`", self.name());
        Ok(())
    }

    /// Blocking [`TableSpec::drop_table`], for use inside a [`SyncGuard`] scope.
    pub fn drop_table_blocking(&self, db: &Db) -> Result<()> {
        db.execute_blocking(&self.drop_table_sql())?;
        info!("Dropped table `{}`", self.name());
        Ok(())
    }
}

/// Every table registered with `inventory::submit!`.
pub fn registered_tables() -> Vec<&'static TableSpec> {
    inventory::iter::<TableSpec>.into_iter().collect()
}

fn drop_table_sql(table: &str) -> String {
    format!("DROP TABLE IF EXISTS \"{}\"", table)
}

/// A value bound to a column in [`Manager::create`] and [`Manager::get`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

pub type Fields<'a> = [(&'a str, FieldValue)];

fn quote_ident(name: &str) -> Result<String> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(format!("\"{}\"", name))
    } else {
        Err(HarnessError::InvalidIdentifier(name.to_string()))
    }
}

fn quoted_list<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
    names.into_iter().map(quote_ident).collect()
}

fn bind_fields<'q, M>(
    mut query: QueryAs<'q, Any, M, AnyArguments<'q>>,
    fields: &Fields<'_>,
) -> QueryAs<'q, Any, M, AnyArguments<'q>> {
    for (_, value) in fields {
        query = match value {
            FieldValue::Text(text) => query.bind(text.clone()),
            FieldValue::Int(int) => query.bind(*int),
            FieldValue::Bool(flag) => query.bind(*flag),
        };
    }
    query
}

/// Async entity operations over a [`DatabaseProxy`].
#[derive(Clone)]
pub struct Manager {
    proxy: Arc<DatabaseProxy>,
}

impl Manager {
    pub fn new(proxy: Arc<DatabaseProxy>) -> Self {
        Manager { proxy }
    }

    pub fn database(&self) -> Result<Arc<Db>> {
        self.proxy.obj()
    }

    /// Insert a row built from `fields` and return it as stored.
    pub async fn create<M>(&self, fields: &Fields<'_>) -> Result<M>
    where
        M: Model + for<'r> FromRow<'r, AnyRow> + Unpin,
    {
        let db = self.proxy.obj()?;
        let table = quote_ident(M::table_name())?;
        let returning = quoted_list(M::columns().iter().copied())?.join(", ");
        let sql = if fields.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES RETURNING {returning}")
        } else {
            let columns = quoted_list(fields.iter().map(|(name, _)| *name))?.join(", ");
            let placeholders = (1..=fields.len())
                .map(|i| format!("${i}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("INSERT INTO {table} ({columns}) VALUES ({placeholders}) RETURNING {returning}")
        };

        debug!("Executing SQL: {}", sql);
        let result = bind_fields(sqlx::query_as::<Any, M>(&sql), fields)
            .fetch_one(db.pool())
            .await;
        if let Err(e) = &result {
            log::error!("Insert into `{}` failed: {}", M::table_name(), e);
        }
        Ok(result?)
    }

    /// First row, ordered by the model's first column, matching every
    /// `column = value` filter.
    pub async fn get<M>(&self, filters: &Fields<'_>) -> Result<M>
    where
        M: Model + for<'r> FromRow<'r, AnyRow> + Unpin,
    {
        let db = self.proxy.obj()?;
        let table = quote_ident(M::table_name())?;
        let selected = quoted_list(M::columns().iter().copied())?;
        let order_by = selected
            .first()
            .map(|column| format!(" ORDER BY {column}"))
            .unwrap_or_default();
        let columns = selected.join(", ");
        let conditions = quoted_list(filters.iter().map(|(name, _)| *name))?
            .into_iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ${}", i + 1))
            .collect::<Vec<_>>();
        let sql = if conditions.is_empty() {
            format!("SELECT {columns} FROM {table}{order_by} LIMIT 1")
        } else {
            format!(
                "SELECT {columns} FROM {table} WHERE {}{order_by} LIMIT 1",
                conditions.join(" AND ")
            )
        };

        debug!("Fetching row with SQL: {}", sql);
        bind_fields(sqlx::query_as::<Any, M>(&sql), filters)
            .fetch_optional(db.pool())
            .await?
            .ok_or(HarnessError::NotFound {
                table: M::table_name(),
            })
    }

    pub async fn count<M: Model>(&self) -> Result<i64> {
        let db = self.proxy.obj()?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(M::table_name())?);
        debug!("Counting rows with SQL: {}", sql);
        let rows = db.fetch_all::<(i64,)>(&sql).await?;
        Ok(rows.first().map_or(0, |(count,)| *count))
    }

    /// Permit blocking calls on the bound handle until the guard is dropped.
    ///
    /// The previous mode is restored on drop, whatever the exit path. Scopes
    /// do not nest: a second call while a guard is alive fails with
    /// [`HarnessError::SyncScopeActive`]. No async operation may run on the
    /// same handle while the scope is active.
    pub fn allow_sync(&self) -> Result<SyncGuard> {
        let db = self.proxy.obj()?;
        let previous = db.enter_sync_scope()?;
        debug!("Entered synchronous override (previous mode: {})", previous);
        Ok(SyncGuard { db, previous })
    }
}

/// Scope in which blocking calls are permitted on a [`Db`].
#[must_use = "the override ends as soon as the guard is dropped"]
pub struct SyncGuard {
    db: Arc<Db>,
    previous: bool,
}

impl SyncGuard {
    pub fn database(&self) -> &Db {
        &self.db
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.db.exit_sync_scope(self.previous);
        debug!("Left synchronous override (restored mode: {})", self.previous);
    }
}
