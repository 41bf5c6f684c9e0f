//! SurrealDB connection configuration and setup.

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StateError;
use crate::migrations;
use crate::Result;

/// Default local persistence directory when nothing is configured.
pub const DEFAULT_LOCAL_PATH: &str = ".recvault/db";

/// Credentials for a remote SurrealDB instance.
#[derive(Debug, Clone)]
pub struct DbCredentials {
    pub username: String,
    pub password: String,
    /// Root user (true) or database user (false)
    pub is_root: bool,
}

/// Connection settings for the backup state database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Engine URL: `mem://`, `surrealkv://<path>`, `ws://…`, `wss://…`
    pub url: String,
    /// Namespace (default: "recvault")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    pub credentials: Option<DbCredentials>,
}

impl DbConfig {
    /// Configuration for an engine URL with default namespace/database.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: "recvault".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }

    /// Ephemeral in-memory database.
    pub fn in_memory() -> Self {
        Self::new("mem://")
    }

    /// Embedded SurrealKV database stored at `path`.
    pub fn local(path: impl AsRef<std::path::Path>) -> Self {
        Self::new(format!("surrealkv://{}", path.as_ref().display()))
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        is_root: bool,
    ) -> Self {
        self.credentials = Some(DbCredentials {
            username: username.into(),
            password: password.into(),
            is_root,
        });
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - RECVAULT_DB_URL (optional, default: `surrealkv://.recvault/db`)
    /// - RECVAULT_DB_NAMESPACE (optional, default: "recvault")
    /// - RECVAULT_DB_DATABASE (optional, default: "main")
    /// - RECVAULT_DB_USERNAME / RECVAULT_DB_PASSWORD (optional, both or neither)
    /// - RECVAULT_DB_ROOT (optional, default: "false") - set to "true" for root users
    pub fn from_env() -> Self {
        let url = std::env::var("RECVAULT_DB_URL")
            .unwrap_or_else(|_| format!("surrealkv://{DEFAULT_LOCAL_PATH}"));
        let mut config = Self::new(url);

        if let Ok(ns) = std::env::var("RECVAULT_DB_NAMESPACE") {
            config = config.with_namespace(ns);
        }
        if let Ok(db) = std::env::var("RECVAULT_DB_DATABASE") {
            config = config.with_database(db);
        }
        if let (Ok(user), Ok(pass)) = (
            std::env::var("RECVAULT_DB_USERNAME"),
            std::env::var("RECVAULT_DB_PASSWORD"),
        ) {
            let is_root = std::env::var("RECVAULT_DB_ROOT")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false);
            config = config.with_credentials(user, pass, is_root);
        }
        config
    }

    fn local_path(&self) -> Option<&str> {
        self.url.strip_prefix("surrealkv://")
    }
}

/// Connect, authenticate, select namespace/database and initialise the schema.
#[instrument(skip(config), fields(url = %config.url, namespace = %config.namespace))]
pub async fn connect(config: &DbConfig) -> Result<Surreal<Any>> {
    if let Some(path) = config.local_path() {
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path, e
            ))
        })?;
    }

    let db = surrealdb::engine::any::connect(&config.url)
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", config.url, e)))?;

    if let Some(creds) = &config.credentials {
        if creds.is_root {
            db.signin(Root {
                username: &creds.username,
                password: &creds.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &creds.username,
                password: &creds.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
        }
    }

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    migrations::init_schema(&db).await?;
    info!("recvault state database connected");
    Ok(db)
}
