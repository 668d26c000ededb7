//! Test database harness.
//!
//! A [`Harness`] owns a [`DatabaseProxy`] and the [`Manager`] built on it,
//! and drives them through setup and teardown:
//!
//! ```text
//! Uninitialized --init_db--> Bound --close_db--> Closed
//!                            Bound --init_db--> Bound
//!                            Closed --init_db--> Bound
//! ```
//!
//! Setup creates every managed table and switches the handle to async-only
//! access. Teardown drops the tables inside a synchronous override scope and
//! releases the connection.
use crate::error::{HarnessError, Result};
use crate::orm::{DatabaseProxy, Db, Manager, ProxyState, TableSpec, registered_tables};
use crate::settings::DatabaseSettings;
use futures::FutureExt;
use log::{error, info};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub struct Harness {
    proxy: Arc<DatabaseProxy>,
    manager: Manager,
    tables: Vec<&'static TableSpec>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// A harness managing every registered model table.
    pub fn new() -> Self {
        Self::with_tables(registered_tables())
    }

    /// A harness managing only `tables`, created in order and dropped in
    /// reverse order.
    pub fn with_tables(tables: Vec<&'static TableSpec>) -> Self {
        let proxy = Arc::new(DatabaseProxy::new());
        Harness {
            manager: Manager::new(proxy.clone()),
            proxy,
            tables,
        }
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn tables(&self) -> &[&'static TableSpec] {
        &self.tables
    }

    pub fn state(&self) -> ProxyState {
        self.proxy.state()
    }

    /// Bind to the PostgreSQL database described by `settings`.
    pub async fn init_db(&self, settings: &DatabaseSettings) -> Result<()> {
        info!(
            "Initializing database `{}` on {}:{} as `{}`",
            settings.name, settings.host, settings.port, settings.user
        );
        self.init_db_url(&settings.url()).await
    }

    /// Bind to the database at `url`, turn off blocking access and create
    /// the managed tables. A handle bound earlier is closed.
    ///
    /// The handle stays bound, async-only, when table creation fails.
    pub async fn init_db_url(&self, url: &str) -> Result<()> {
        let db = Db::connect(url).await?;
        db.set_allow_sync(false);
        if let Some(previous) = self.proxy.initialize(db) {
            info!("Replacing previously bound database handle");
            previous.close().await;
        }
        self.create_tables().await
    }

    /// Create every managed table that does not exist yet.
    pub async fn create_tables(&self) -> Result<()> {
        let db = self.proxy.obj()?;
        for table in &self.tables {
            table.create_table(&db).await?;
        }
        Ok(())
    }

    /// Drop every managed table through blocking calls made inside a
    /// synchronous override scope. Missing tables are not an error.
    ///
    /// Needs a multi-threaded tokio runtime.
    pub fn drop_tables(&self) -> Result<()> {
        let guard = self.manager.allow_sync()?;
        for table in self.tables.iter().rev() {
            table.drop_table_blocking(guard.database())?;
        }
        Ok(())
    }

    /// Async counterpart of [`Harness::drop_tables`], usable on any runtime.
    pub async fn drop_all(&self) -> Result<()> {
        let db = self.proxy.obj()?;
        for table in self.tables.iter().rev() {
            table.drop_table(&db).await?;
        }
        Ok(())
    }

    pub async fn close_db(&self) {
        self.proxy.close().await;
    }

    /// Run a test body, then tear down with [`Harness::drop_tables`] and
    /// [`Harness::close_db`]. On a current-thread runtime, where blocking
    /// calls are unavailable, the tables are dropped with
    /// [`Harness::drop_all`] instead.
    ///
    /// Teardown also runs when the body panics; the panic is resumed
    /// afterwards. A teardown error is returned only if the body completed.
    pub async fn run<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Manager) -> Fut,
        Fut: Future<Output = T>,
    {
        let outcome = AssertUnwindSafe(body(self.manager.clone()))
            .catch_unwind()
            .await;

        let dropped = match self.drop_tables() {
            Err(HarnessError::BlockingUnsupported) => self.drop_all().await,
            other => other,
        };
        if let Err(e) = &dropped {
            error!("Teardown could not drop tables: {}", e);
        }
        self.close_db().await;

        match outcome {
            Ok(value) => dropped.map(|_| value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}
