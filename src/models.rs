use crate::error::Result;
use crate::orm::{Dialect, FieldValue, FromRow, Manager, Model, TableSpec};
use serde::{Deserialize, Serialize};

/// The entity under test: a store-assigned id and a name.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
}

impl Model for User {
    fn table_name() -> &'static str {
        "users"
    }

    fn create_table_sql(dialect: Dialect) -> String {
        let id = match dialect {
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        };
        format!(
            "CREATE TABLE IF NOT EXISTS \"users\" (\"id\" {}, \"name\" VARCHAR(255) NOT NULL)",
            id
        )
    }

    fn columns() -> &'static [&'static str] {
        &["id", "name"]
    }
}

inventory::submit! {
    TableSpec::of::<User>()
}

impl User {
    pub async fn create(manager: &Manager, name: &str) -> Result<Self> {
        manager
            .create::<User>(&[("name", FieldValue::from(name))])
            .await
    }

    pub async fn get_by_name(manager: &Manager, name: &str) -> Result<Self> {
        manager.get::<User>(&[("name", FieldValue::from(name))]).await
    }
}
