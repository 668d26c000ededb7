use crate::error::ConfigError;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::fmt;

pub const PG_DATABASE_ENV_VAR: &str = "PG_DATABASE";
pub const PG_HOST_ENV_VAR: &str = "PG_HOST";
pub const PG_USER_ENV_VAR: &str = "PG_USER";
pub const PG_PASSWORD_ENV_VAR: &str = "PG_PASSWORD";
pub const PG_PORT_ENV_VAR: &str = "PG_PORT";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_PORT: u16 = 5432;

// Unreserved characters stay as-is in the userinfo and path of the URL.
const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Connection settings for the PostgreSQL database under test.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl DatabaseSettings {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        DatabaseSettings {
            name: name.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            password: password.into(),
        }
    }

    /// Read settings from the `PG_*` environment variables.
    ///
    /// `PG_DATABASE` and `PG_PASSWORD` are required; host, user and port fall
    /// back to `localhost`, `postgres` and `5432`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`DatabaseSettings::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| lookup(var).ok_or(ConfigError::Missing(var));

        let name = required(PG_DATABASE_ENV_VAR)?;
        let password = required(PG_PASSWORD_ENV_VAR)?;
        let host = lookup(PG_HOST_ENV_VAR).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let user = lookup(PG_USER_ENV_VAR).unwrap_or_else(|| DEFAULT_USER.to_string());
        let port = match lookup(PG_PORT_ENV_VAR) {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: PG_PORT_ENV_VAR,
                value,
            })?,
            None => DEFAULT_PORT,
        };

        Ok(DatabaseSettings {
            name,
            host,
            port,
            user,
            password,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Connection URL understood by the sqlx `Any` driver.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            utf8_percent_encode(&self.user, URL_COMPONENT),
            utf8_percent_encode(&self.password, URL_COMPONENT),
            self.url_host(),
            self.port,
            utf8_percent_encode(&self.name, URL_COMPONENT),
        )
    }

    // IPv6 literals need brackets to be told apart from the port.
    fn url_host(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}
