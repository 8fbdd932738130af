use crate::Error;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::time::Duration;

/// Application name reported to the server for connections.
pub const APPLICATION_NAME: &str = "pg-rx";

/// ConnectConfig describes how to reach a database: either as a URL,
/// or as separate connection fields. Fields which are omitted fall back
/// to libpq environment variables (PGHOST, PGUSER, ...) and defaults.
#[derive(Derivative, Clone, PartialEq, Serialize, Deserialize)]
#[derivative(Debug)]
#[serde(untagged)]
pub enum ConnectConfig {
    Url(#[derivative(Debug = "ignore")] url::Url),
    Fields {
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        user: Option<String>,
        #[derivative(Debug = "ignore")]
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        database: Option<String>,
    },
}

impl ConnectConfig {
    pub fn to_options(&self) -> Result<PgConnectOptions, Error> {
        let options = match self {
            Self::Url(url) => url
                .as_str()
                .parse::<PgConnectOptions>()
                .map_err(|err| Error::Connection(format!("invalid database URL: {err}")))?,
            Self::Fields {
                host,
                port,
                user,
                password,
                database,
            } => {
                let mut options = PgConnectOptions::new();
                if let Some(host) = host {
                    options = options.host(host);
                }
                if let Some(port) = port {
                    options = options.port(*port);
                }
                if let Some(user) = user {
                    options = options.username(user);
                }
                if let Some(password) = password {
                    options = options.password(password);
                }
                if let Some(database) = database {
                    options = options.database(database);
                }
                options
            }
        };
        Ok(options.application_name(APPLICATION_NAME))
    }
}

impl std::str::FromStr for ConnectConfig {
    type Err = url::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::Url(s.parse()?))
    }
}

/// Options of a connection pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolOptions {
    pub max_connections: u32,
    /// Maximum time to wait for a pooled connection before failing
    /// acquisition with a connection error.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolOptions {
    pub(crate) fn to_sqlx(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
    }
}
