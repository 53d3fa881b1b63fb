//! Store identity and schema version.
//!
//! Every store file carries a one-row `store_meta` table naming the
//! application that created it and the schema version it was written with.
//! [`init_store`] refuses files that belong to something else or that were
//! written by a newer build, before any DDL touches them.

use crate::{init_sqlite_schema, ControlError, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

/// Application tag stamped into every store.
pub const STORE_APPLICATION: &str = "tablegate";

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 1;

/// Contents of the `store_meta` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreInfo {
    pub application: String,
    pub schema_version: i64,
    pub created_at: String,
}

fn has_meta_table(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'store_meta'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn user_table_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?)
}

/// Read the store stamp, or `None` for a file that has never been stamped.
pub fn read_store_info(conn: &Connection) -> Result<Option<StoreInfo>> {
    if !has_meta_table(conn)? {
        return Ok(None);
    }
    let info = conn
        .query_row(
            "SELECT application, schema_version, created_at FROM store_meta WHERE id = 1",
            [],
            |row| {
                Ok(StoreInfo {
                    application: row.get(0)?,
                    schema_version: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(info)
}

/// Check that a stamped store can be opened by this build.
pub fn check_compatible(info: &StoreInfo) -> Result<()> {
    if info.application != STORE_APPLICATION {
        return Err(ControlError::Config(format!(
            "store belongs to '{}', not {}",
            info.application, STORE_APPLICATION
        )));
    }
    if info.schema_version > SCHEMA_VERSION {
        return Err(ControlError::Config(format!(
            "store schema v{} is newer than this build (v{})",
            info.schema_version, SCHEMA_VERSION
        )));
    }
    if info.schema_version < SCHEMA_VERSION {
        return Err(ControlError::Config(format!(
            "store schema v{} predates this build (v{}) and has no upgrade path",
            info.schema_version, SCHEMA_VERSION
        )));
    }
    Ok(())
}

/// Open or create a store on `conn`.
///
/// An empty database is given the full schema and stamped. A stamped one is
/// checked with [`check_compatible`]. A database that already holds tables
/// but no stamp is some other application's file and is rejected untouched.
pub fn init_store(conn: &Connection) -> Result<StoreInfo> {
    if let Some(info) = read_store_info(conn)? {
        check_compatible(&info)?;
        init_sqlite_schema(conn)?;
        debug!(version = info.schema_version, "Opened existing store");
        return Ok(info);
    }

    let tables = user_table_count(conn)?;
    if tables > 0 {
        return Err(ControlError::Config(format!(
            "database holds {} tables but no {} stamp",
            tables, STORE_APPLICATION
        )));
    }

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let created = init_sqlite_schema(conn).and_then(|_| {
        conn.execute_batch(
            "CREATE TABLE store_meta (
               id INTEGER PRIMARY KEY CHECK (id = 1),
               application TEXT NOT NULL,
               schema_version INTEGER NOT NULL,
               created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
             )",
        )?;
        conn.execute(
            "INSERT INTO store_meta (id, application, schema_version) VALUES (1, ?1, ?2)",
            rusqlite::params![STORE_APPLICATION, SCHEMA_VERSION],
        )?;
        Ok(())
    });
    match created {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    info!(version = SCHEMA_VERSION, "Created store");
    read_store_info(conn)?
        .ok_or_else(|| ControlError::Other("store stamp missing after create".into()))
}
