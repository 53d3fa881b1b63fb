//! Tablegate Core
//!
//! Core types, pure state machines, and the SQLite schema for the tablegate
//! control plane: who may administer a workspace, product, database, or table,
//! which applications may access which resources, and the ordered filter/plugin
//! chains attached to each table.

pub mod chain;
pub mod clock;
pub mod expiry;
pub mod grant;
pub mod membership;
pub mod model;
pub mod schema;
pub mod validation;

pub use model::*;

/// Stable classification of [`ControlError`] values.
///
/// The admin facade maps each kind to a numeric code via [`ErrorKind::code`];
/// the numbers are part of the external contract and must not be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    NotManager,
    NotMember,
    AlreadyMember,
    MemberExpired,
    UnderApproval,
    NotUnderApproval,
    AlreadyNormal,
    AlreadyChecking,
    InvalidParam,
    NotFirstInChain,
    ChainHeadNotFound,
    PermissionDenied,
    Config,
    Storage,
    Internal,
}

impl ErrorKind {
    /// Numeric code reported to callers.
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::NotFound => 1001,
            ErrorKind::NotManager => 1002,
            ErrorKind::NotMember => 1003,
            ErrorKind::AlreadyMember => 1004,
            ErrorKind::MemberExpired => 1005,
            ErrorKind::UnderApproval => 1006,
            ErrorKind::NotUnderApproval => 1007,
            ErrorKind::AlreadyNormal => 1008,
            ErrorKind::AlreadyChecking => 1009,
            ErrorKind::InvalidParam => 1010,
            ErrorKind::NotFirstInChain => 1011,
            ErrorKind::ChainHeadNotFound => 1012,
            ErrorKind::PermissionDenied => 1013,
            ErrorKind::Config => 1100,
            ErrorKind::Storage => 1500,
            ErrorKind::Internal => 1999,
        }
    }
}

/// Errors that can occur in control plane operations
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not manager: {0}")]
    NotManager(String),

    #[error("Not member: {0}")]
    NotMember(String),

    #[error("Already member: {0}")]
    AlreadyMember(String),

    #[error("Member expired: {0}")]
    MemberExpired(String),

    #[error("Under approval: {0}")]
    UnderApproval(String),

    #[error("Not under approval: {0}")]
    NotUnderApproval(String),

    #[error("Access already normal: {0}")]
    AlreadyNormal(String),

    #[error("Access already under review: {0}")]
    AlreadyChecking(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Not first in chain: {0}")]
    NotFirstInChain(String),

    #[error("Chain head not found: {0}")]
    ChainHeadNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl ControlError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Sqlite(_) => ErrorKind::Storage,
            ControlError::NotFound(_) => ErrorKind::NotFound,
            ControlError::NotManager(_) => ErrorKind::NotManager,
            ControlError::NotMember(_) => ErrorKind::NotMember,
            ControlError::AlreadyMember(_) => ErrorKind::AlreadyMember,
            ControlError::MemberExpired(_) => ErrorKind::MemberExpired,
            ControlError::UnderApproval(_) => ErrorKind::UnderApproval,
            ControlError::NotUnderApproval(_) => ErrorKind::NotUnderApproval,
            ControlError::AlreadyNormal(_) => ErrorKind::AlreadyNormal,
            ControlError::AlreadyChecking(_) => ErrorKind::AlreadyChecking,
            ControlError::InvalidParam(_) => ErrorKind::InvalidParam,
            ControlError::NotFirstInChain(_) => ErrorKind::NotFirstInChain,
            ControlError::ChainHeadNotFound(_) => ErrorKind::ChainHeadNotFound,
            ControlError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ControlError::Config(_) => ErrorKind::Config,
            ControlError::Serialization(_) | ControlError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Numeric code for the facade.
    pub fn code(&self) -> u32 {
        self.kind().code()
    }

    /// Returns true if the caller can fix the precondition and retry.
    ///
    /// Storage failures and chain corruption are not user errors.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Storage | ErrorKind::Internal | ErrorKind::ChainHeadNotFound
        )
    }
}

/// Result type for control plane operations
pub type Result<T> = std::result::Result<T, ControlError>;

/// Initialize the SQLite schema for the control plane
///
/// Creates all necessary tables if they don't exist:
/// - `scopes`: workspaces and products with their manager lists
/// - `memberships`: one row per (scope, user)
/// - `databases`, `tables`: catalog resources
/// - `applications`: client identities
/// - `grants`: one row per (resource, application)
/// - `extensions`: the filter/plugin registry
/// - `chain_nodes`: the per-table execution chains
/// - `search_keywords`: the keyword index kept by the background indexer
///
/// Callers opening a store file should go through [`schema::init_store`],
/// which also checks the file's identity and schema version.
pub fn init_sqlite_schema(conn: &rusqlite::Connection) -> Result<()> {
    let ddl = r#"
    CREATE TABLE IF NOT EXISTS scopes (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      scope_type TEXT NOT NULL,
      name TEXT NOT NULL,
      intro TEXT NOT NULL DEFAULT '',
      creator INTEGER NOT NULL,
      managers TEXT NOT NULL DEFAULT '[]',
      status TEXT NOT NULL DEFAULT 'online',
      created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
      updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
      UNIQUE(scope_type, name)
    );

    CREATE TABLE IF NOT EXISTS memberships (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      scope_type TEXT NOT NULL,
      scope_id INTEGER NOT NULL,
      user_id INTEGER NOT NULL,
      role TEXT NOT NULL,
      status TEXT NOT NULL,
      join_time INTEGER NOT NULL DEFAULT 0,
      expire_type INTEGER NOT NULL DEFAULT 0,
      expire_time INTEGER NOT NULL DEFAULT 0,
      out_time INTEGER NOT NULL DEFAULT 0,
      pending_role TEXT,
      created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
      updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
      UNIQUE(scope_type, scope_id, user_id)
    );

    CREATE INDEX IF NOT EXISTS idx_memberships_scope ON memberships(scope_type, scope_id);

    CREATE TABLE IF NOT EXISTS databases (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      name TEXT NOT NULL,
      product_id INTEGER NOT NULL,
      managers TEXT NOT NULL DEFAULT '[]',
      status TEXT NOT NULL DEFAULT 'online',
      created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
      FOREIGN KEY (product_id) REFERENCES scopes(id)
    );

    CREATE INDEX IF NOT EXISTS idx_databases_product ON databases(product_id);

    CREATE TABLE IF NOT EXISTS tables (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      name TEXT NOT NULL,
      database_id INTEGER NOT NULL,
      status TEXT NOT NULL DEFAULT 'online',
      created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
      FOREIGN KEY (database_id) REFERENCES databases(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_tables_database ON tables(database_id);

    CREATE TABLE IF NOT EXISTS applications (
      app_id INTEGER PRIMARY KEY,
      name TEXT NOT NULL,
      intro TEXT NOT NULL DEFAULT '',
      creator INTEGER NOT NULL,
      managers TEXT NOT NULL DEFAULT '[]',
      status TEXT NOT NULL DEFAULT 'online',
      created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS grants (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      resource_type TEXT NOT NULL,
      resource_id INTEGER NOT NULL,
      app_id INTEGER NOT NULL,
      capability TEXT NOT NULL,
      ops TEXT NOT NULL DEFAULT '[]',
      status TEXT NOT NULL,
      apply_user INTEGER NOT NULL,
      reason TEXT NOT NULL DEFAULT '',
      reviewed_by INTEGER,
      created_at INTEGER NOT NULL,
      updated_at INTEGER NOT NULL,
      UNIQUE(resource_type, resource_id, app_id)
    );

    CREATE INDEX IF NOT EXISTS idx_grants_app ON grants(app_id);

    CREATE TABLE IF NOT EXISTS extensions (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      kind TEXT NOT NULL,
      name TEXT NOT NULL,
      versions TEXT NOT NULL DEFAULT '[]',
      stages TEXT NOT NULL DEFAULT '[]',
      online INTEGER NOT NULL DEFAULT 1,
      UNIQUE(kind, name)
    );

    CREATE TABLE IF NOT EXISTS chain_nodes (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      table_id INTEGER NOT NULL,
      kind TEXT NOT NULL,
      stage TEXT NOT NULL,
      extension_id INTEGER NOT NULL,
      extension_version INTEGER NOT NULL,
      front INTEGER NOT NULL DEFAULT 0,
      enabled INTEGER NOT NULL DEFAULT 1,
      schedule_config TEXT NOT NULL DEFAULT 'null',
      config TEXT NOT NULL DEFAULT 'null',
      description TEXT NOT NULL DEFAULT '',
      created_at INTEGER NOT NULL,
      updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_chain_nodes_chain ON chain_nodes(table_id, kind, stage);
    CREATE INDEX IF NOT EXISTS idx_chain_nodes_front ON chain_nodes(table_id, kind, stage, front);

    CREATE TABLE IF NOT EXISTS search_keywords (
      kind TEXT NOT NULL,
      subject_id INTEGER NOT NULL,
      subject_name TEXT NOT NULL,
      field TEXT NOT NULL,
      key TEXT NOT NULL,
      content TEXT NOT NULL,
      updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
      PRIMARY KEY (kind, subject_id, field, key)
    );

    CREATE INDEX IF NOT EXISTS idx_search_keywords_content ON search_keywords(content);
    "#;

    conn.execute_batch(ddl)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &rusqlite::Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_init_schema() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        init_sqlite_schema(&conn).unwrap();

        let tables = table_names(&conn);
        for expected in [
            "scopes",
            "memberships",
            "databases",
            "tables",
            "applications",
            "grants",
            "extensions",
            "chain_nodes",
            "search_keywords",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_membership_uniqueness_constraint() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        init_sqlite_schema(&conn).unwrap();

        let insert = "INSERT INTO memberships (scope_type, scope_id, user_id, role, status)
                      VALUES ('product', 1, 42, 'developer', 'pending_approval')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        init_sqlite_schema(&conn).unwrap();
        init_sqlite_schema(&conn).unwrap();

        let reviewed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('grants') WHERE name = 'reviewed_by'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(reviewed, 1);
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ControlError::NotFound("x".into()).code(), 1001);
        assert_eq!(ControlError::NotFirstInChain("x".into()).code(), 1011);
        assert_eq!(ControlError::ChainHeadNotFound("x".into()).code(), 1012);
        assert!(ControlError::InvalidParam("x".into()).is_user_error());
        assert!(!ControlError::ChainHeadNotFound("x".into()).is_user_error());
        assert!(!ControlError::Other("x".into()).is_user_error());
    }
}
