pub mod error;
pub mod harness;
pub mod models;
pub mod orm;
pub mod settings;

pub use error::{ConfigError, HarnessError};
pub use harness::Harness;
pub use models::User;

inventory::collect!(crate::orm::TableSpec);
