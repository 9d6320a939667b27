//! Connection parameters for the remote worker
//!
//! Passed to the worker as libpq `PG*` environment variables. Only the keys
//! in [`PgEnvVar`] are ever produced.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::EnvVar;
use serde::Serialize;

/// Default libpq SSL mode: encrypt and verify the server's host name
pub const SSL_MODE_VERIFY_FULL: &str = "verify-full";

/// A recognized libpq environment variable
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PgEnvVar {
    /// `PGHOST`
    Host,
    /// `PGPORT`
    Port,
    /// `PGUSER`
    User,
    /// `PGDATABASE`
    Database,
    /// `PGSSLMODE`
    SslMode,
    /// `PGSSLCERT`
    SslCert,
    /// `PGSSLKEY`
    SslKey,
    /// `PGSSLROOTCERT`
    SslRootCert,
}

impl PgEnvVar {
    /// Environment variable name
    pub fn as_str(&self) -> &'static str {
        match self {
            PgEnvVar::Host => "PGHOST",
            PgEnvVar::Port => "PGPORT",
            PgEnvVar::User => "PGUSER",
            PgEnvVar::Database => "PGDATABASE",
            PgEnvVar::SslMode => "PGSSLMODE",
            PgEnvVar::SslCert => "PGSSLCERT",
            PgEnvVar::SslKey => "PGSSLKEY",
            PgEnvVar::SslRootCert => "PGSSLROOTCERT",
        }
    }
}

impl fmt::Display for PgEnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to reach and authenticate to one Postgres endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresCredentials {
    /// Host name
    pub host: String,
    /// Port
    pub port: u16,
    /// Role to connect as
    pub user: String,
    /// Database to connect to
    pub database: String,
    /// libpq SSL mode
    pub ssl_mode: String,
    /// Client certificate file
    pub ssl_cert: Option<String>,
    /// Client private key file
    pub ssl_key: Option<String>,
    /// CA bundle used to verify the server
    pub ssl_root_cert: Option<String>,
}

impl PostgresCredentials {
    /// Credentials for `user` on `host`, verifying the server fully
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            database: database.into(),
            ssl_mode: SSL_MODE_VERIFY_FULL.to_string(),
            ssl_cert: None,
            ssl_key: None,
            ssl_root_cert: None,
        }
    }

    /// Authenticate with the `tls.crt`/`tls.key` pair mounted at `dir`
    pub fn with_client_certificate(mut self, dir: &str) -> Self {
        let dir = dir.trim_end_matches('/');
        self.ssl_cert = Some(format!("{}/tls.crt", dir));
        self.ssl_key = Some(format!("{}/tls.key", dir));
        self
    }

    /// Verify the server against the CA file at `path`
    pub fn with_root_certificate(mut self, path: impl Into<String>) -> Self {
        self.ssl_root_cert = Some(path.into());
        self
    }

    /// Variables in a stable order; unset optional values are omitted
    pub fn to_env(&self) -> BTreeMap<PgEnvVar, String> {
        let mut env = BTreeMap::new();
        env.insert(PgEnvVar::Host, self.host.clone());
        env.insert(PgEnvVar::Port, self.port.to_string());
        env.insert(PgEnvVar::User, self.user.clone());
        env.insert(PgEnvVar::Database, self.database.clone());
        env.insert(PgEnvVar::SslMode, self.ssl_mode.clone());
        for (var, value) in [
            (PgEnvVar::SslCert, &self.ssl_cert),
            (PgEnvVar::SslKey, &self.ssl_key),
            (PgEnvVar::SslRootCert, &self.ssl_root_cert),
        ] {
            if let Some(value) = value {
                env.insert(var, value.clone());
            }
        }
        env
    }

    /// Container environment for the worker
    pub fn to_env_vars(&self) -> Vec<EnvVar> {
        self.to_env()
            .into_iter()
            .map(|(var, value)| EnvVar {
                name: var.as_str().to_string(),
                value: Some(value),
                value_from: None,
            })
            .collect()
    }
}
