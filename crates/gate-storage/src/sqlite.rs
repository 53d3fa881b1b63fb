//! SQLite implementation of the persistence gateway.

use crate::{ChainStore, GrantStore, MembershipStore, ScopeStore, SearchIndexStore};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tablegate_core::{
    schema, AppId, Application, Capability, ChainKey, ChainNode, ControlError, Database,
    ExpireType, Extension, ExtensionKind, Grant, GrantPatch, MemberRole, MemberStatus, Membership,
    MembershipPatch, NodeId, NodePatch, OnlineStatus, Page, PageRequest, ResourceType, Result,
    Scope, ScopeType, SearchKeyword, SearchKind, TableInfo, UserId,
};
use tracing::debug;

/// SQLite-backed store.
///
/// Holds one connection behind a mutex; every trait call locks it for the
/// duration of a single statement or short statement group.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

impl SqliteStore {
    /// Open (or create) a store file and bring its schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ControlError::Other(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let info = schema::init_store(&conn)?;
        debug!(version = info.schema_version, path = ?path, "Store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the underlying connection.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

// ============================================================================
// Row helpers
// ============================================================================

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ControlError>,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_error(idx, e))
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// `%keyword%` for `LIKE ... ESCAPE '\'`, with wildcards in `keyword` escaped.
fn like_pattern(keyword: &str) -> String {
    let mut pattern = String::with_capacity(keyword.len() + 2);
    pattern.push('%');
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn as_refs(params: &[Box<dyn ToSql>]) -> Vec<&dyn ToSql> {
    params.iter().map(|p| p.as_ref()).collect()
}

/// Run a dynamic `UPDATE <table> SET ... WHERE <key> = ?`. An empty patch is a no-op.
fn execute_update(
    conn: &Connection,
    table: &str,
    key_column: &str,
    key: i64,
    updates: Vec<&str>,
    mut params: Vec<Box<dyn ToSql>>,
) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        table,
        updates.join(", "),
        key_column
    );
    params.push(Box::new(key));

    let rows = conn.execute(&sql, as_refs(&params).as_slice())?;
    if rows == 0 {
        return Err(ControlError::NotFound(format!(
            "{} row {} not found",
            table, key
        )));
    }
    Ok(())
}

fn paged<T>(
    conn: &Connection,
    from_where: &str,
    columns: &str,
    params: Vec<Box<dyn ToSql>>,
    page: PageRequest,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Page<T>> {
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) {}", from_where),
        as_refs(&params).as_slice(),
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT {} {} ORDER BY id LIMIT {} OFFSET {}",
        columns,
        from_where,
        page.size,
        page.offset()
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(as_refs(&params).as_slice(), map)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Page::new(items, total.max(0) as u64, page))
}

// ============================================================================
// Scopes and catalog resources
// ============================================================================

const SCOPE_COLUMNS: &str = "id, scope_type, name, intro, creator, managers, status";

fn row_to_scope(row: &Row<'_>) -> rusqlite::Result<Scope> {
    Ok(Scope {
        id: row.get(0)?,
        scope_type: text_col(row, 1)?,
        name: row.get(2)?,
        intro: row.get(3)?,
        creator: row.get(4)?,
        managers: json_col(row, 5)?,
        status: text_col(row, 6)?,
    })
}

const DATABASE_COLUMNS: &str = "id, name, product_id, managers, status";

fn row_to_database(row: &Row<'_>) -> rusqlite::Result<Database> {
    Ok(Database {
        id: row.get(0)?,
        name: row.get(1)?,
        product_id: row.get(2)?,
        managers: json_col(row, 3)?,
        status: text_col(row, 4)?,
    })
}

const APPLICATION_COLUMNS: &str = "app_id, name, intro, creator, managers, status";

fn row_to_application(row: &Row<'_>) -> rusqlite::Result<Application> {
    Ok(Application {
        app_id: row.get(0)?,
        name: row.get(1)?,
        intro: row.get(2)?,
        creator: row.get(3)?,
        managers: json_col(row, 4)?,
        status: text_col(row, 5)?,
    })
}

impl ScopeStore for SqliteStore {
    fn get_scope(&self, scope_type: ScopeType, id: i64) -> Result<Option<Scope>> {
        let conn = self.conn.lock();
        let scope = conn
            .query_row(
                &format!(
                    "SELECT {} FROM scopes WHERE id = ?1 AND scope_type = ?2",
                    SCOPE_COLUMNS
                ),
                params![id, scope_type.as_str()],
                row_to_scope,
            )
            .optional()?;
        Ok(scope)
    }

    fn insert_scope(&self, scope: &Scope) -> Result<i64> {
        let managers = to_json(&scope.managers)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO scopes (scope_type, name, intro, creator, managers, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                scope.scope_type.as_str(),
                scope.name,
                scope.intro,
                scope.creator,
                managers,
                scope.status.as_str()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn set_scope_managers(&self, scope_type: ScopeType, id: i64, managers: &[UserId]) -> Result<()> {
        let managers = to_json(managers)?;
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE scopes SET managers = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?2 AND scope_type = ?3",
            params![managers, id, scope_type.as_str()],
        )?;
        if rows == 0 {
            return Err(ControlError::NotFound(format!("{} {} not found", scope_type, id)));
        }
        Ok(())
    }

    fn get_database(&self, id: i64) -> Result<Option<Database>> {
        let conn = self.conn.lock();
        let db = conn
            .query_row(
                &format!("SELECT {} FROM databases WHERE id = ?1", DATABASE_COLUMNS),
                [id],
                row_to_database,
            )
            .optional()?;
        Ok(db)
    }

    fn insert_database(&self, database: &Database) -> Result<i64> {
        let managers = to_json(&database.managers)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO databases (name, product_id, managers, status) VALUES (?1, ?2, ?3, ?4)",
            params![
                database.name,
                database.product_id,
                managers,
                database.status.as_str()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_table(&self, id: i64) -> Result<Option<TableInfo>> {
        let conn = self.conn.lock();
        let table = conn
            .query_row(
                "SELECT id, name, database_id, status FROM tables WHERE id = ?1",
                [id],
                |row| {
                    Ok(TableInfo {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        database_id: row.get(2)?,
                        status: text_col(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(table)
    }

    fn insert_table(&self, table: &TableInfo) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tables (name, database_id, status) VALUES (?1, ?2, ?3)",
            params![table.name, table.database_id, table.status.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_application(&self, app_id: AppId) -> Result<Option<Application>> {
        let conn = self.conn.lock();
        let app = conn
            .query_row(
                &format!(
                    "SELECT {} FROM applications WHERE app_id = ?1",
                    APPLICATION_COLUMNS
                ),
                [app_id],
                row_to_application,
            )
            .optional()?;
        Ok(app)
    }

    fn insert_application(&self, app: &Application) -> Result<()> {
        let managers = to_json(&app.managers)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO applications (app_id, name, intro, creator, managers, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                app.app_id,
                app.name,
                app.intro,
                app.creator,
                managers,
                app.status.as_str()
            ],
        )?;
        Ok(())
    }

    fn set_application_status(&self, app_id: AppId, status: OnlineStatus) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE applications SET status = ?1 WHERE app_id = ?2",
            params![status.as_str(), app_id],
        )?;
        if rows == 0 {
            return Err(ControlError::NotFound(format!("application {} not found", app_id)));
        }
        Ok(())
    }

    fn managed_applications(
        &self,
        user: UserId,
        status: Option<OnlineStatus>,
        keyword: Option<&str>,
    ) -> Result<Vec<Application>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM applications
             WHERE EXISTS (SELECT 1 FROM json_each(applications.managers) WHERE value = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL
                    OR name LIKE ?3 ESCAPE '\\'
                    OR CAST(app_id AS TEXT) LIKE ?3 ESCAPE '\\')
             ORDER BY app_id",
            APPLICATION_COLUMNS
        ))?;
        let apps = stmt
            .query_map(
                params![user, status.map(|s| s.as_str()), keyword.map(like_pattern)],
                row_to_application,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(apps)
    }
}

// ============================================================================
// Memberships
// ============================================================================

const MEMBERSHIP_COLUMNS: &str = "id, scope_type, scope_id, user_id, role, status, join_time, \
                                  expire_type, expire_time, out_time, pending_role";

fn row_to_membership(row: &Row<'_>) -> rusqlite::Result<Membership> {
    let expire_type: i64 = row.get(7)?;
    let pending_role: Option<String> = row.get(10)?;
    Ok(Membership {
        id: row.get(0)?,
        scope_type: text_col(row, 1)?,
        scope_id: row.get(2)?,
        user_id: row.get(3)?,
        role: text_col(row, 4)?,
        status: text_col(row, 5)?,
        join_time: row.get(6)?,
        expire_type: ExpireType::from_code(expire_type).map_err(|e| conversion_error(7, e))?,
        expire_time: row.get(8)?,
        out_time: row.get(9)?,
        pending_role: pending_role
            .map(|r| r.parse::<MemberRole>())
            .transpose()
            .map_err(|e| conversion_error(10, e))?,
    })
}

impl MembershipStore for SqliteStore {
    fn find_membership(
        &self,
        scope_type: ScopeType,
        scope_id: i64,
        user: UserId,
    ) -> Result<Option<Membership>> {
        let conn = self.conn.lock();
        let membership = conn
            .query_row(
                &format!(
                    "SELECT {} FROM memberships
                     WHERE scope_type = ?1 AND scope_id = ?2 AND user_id = ?3",
                    MEMBERSHIP_COLUMNS
                ),
                params![scope_type.as_str(), scope_id, user],
                row_to_membership,
            )
            .optional()?;
        Ok(membership)
    }

    fn insert_membership(&self, m: &Membership) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memberships (scope_type, scope_id, user_id, role, status, join_time,
                                      expire_type, expire_time, out_time, pending_role)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                m.scope_type.as_str(),
                m.scope_id,
                m.user_id,
                m.role.as_str(),
                m.status.as_str(),
                m.join_time,
                m.expire_type.code(),
                m.expire_time,
                m.out_time,
                m.pending_role.map(|r| r.as_str()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn replace_membership(&self, m: &Membership) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE memberships
             SET role = ?1, status = ?2, join_time = ?3, expire_type = ?4, expire_time = ?5,
                 out_time = ?6, pending_role = ?7, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?8",
            params![
                m.role.as_str(),
                m.status.as_str(),
                m.join_time,
                m.expire_type.code(),
                m.expire_time,
                m.out_time,
                m.pending_role.map(|r| r.as_str()),
                m.id,
            ],
        )?;
        if rows == 0 {
            return Err(ControlError::NotFound(format!("membership {} not found", m.id)));
        }
        Ok(())
    }

    fn update_membership(&self, id: i64, patch: &MembershipPatch) -> Result<()> {
        let mut updates = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(role) = patch.role {
            updates.push("role = ?");
            params.push(Box::new(role.as_str()));
        }
        if let Some(status) = patch.status {
            updates.push("status = ?");
            params.push(Box::new(status.as_str()));
        }
        if let Some(join_time) = patch.join_time {
            updates.push("join_time = ?");
            params.push(Box::new(join_time));
        }
        if let Some(expire_type) = patch.expire_type {
            updates.push("expire_type = ?");
            params.push(Box::new(expire_type.code()));
        }
        if let Some(expire_time) = patch.expire_time {
            updates.push("expire_time = ?");
            params.push(Box::new(expire_time));
        }
        if let Some(out_time) = patch.out_time {
            updates.push("out_time = ?");
            params.push(Box::new(out_time));
        }
        if let Some(pending_role) = patch.pending_role {
            updates.push("pending_role = ?");
            params.push(Box::new(pending_role.map(|r| r.as_str())));
        }
        if !updates.is_empty() {
            updates.push("updated_at = CURRENT_TIMESTAMP");
        }

        let conn = self.conn.lock();
        execute_update(&conn, "memberships", "id", id, updates, params)
    }

    fn list_memberships(
        &self,
        scope_type: ScopeType,
        scope_id: i64,
        statuses: Option<&[MemberStatus]>,
        page: PageRequest,
    ) -> Result<Page<Membership>> {
        let mut params: Vec<Box<dyn ToSql>> =
            vec![Box::new(scope_type.as_str()), Box::new(scope_id)];
        let mut from_where = "FROM memberships WHERE scope_type = ? AND scope_id = ?".to_string();

        if let Some(statuses) = statuses {
            if statuses.is_empty() {
                return Ok(Page::new(Vec::new(), 0, page));
            }
            from_where.push_str(&format!(" AND status IN ({})", placeholders(statuses.len())));
            for status in statuses {
                params.push(Box::new(status.as_str()));
            }
        }

        let conn = self.conn.lock();
        paged(&conn, &from_where, MEMBERSHIP_COLUMNS, params, page, row_to_membership)
    }
}

// ============================================================================
// Grants
// ============================================================================

const GRANT_COLUMNS: &str = "id, resource_type, resource_id, app_id, capability, ops, status, \
                             apply_user, reason, reviewed_by, created_at, updated_at";

fn row_to_grant(row: &Row<'_>) -> rusqlite::Result<Grant> {
    let resource_type: ResourceType = text_col(row, 1)?;
    let capability: String = row.get(4)?;
    Ok(Grant {
        id: row.get(0)?,
        resource_type,
        resource_id: row.get(2)?,
        app_id: row.get(3)?,
        capability: Capability::parse(resource_type, &capability)
            .map_err(|e| conversion_error(4, e))?,
        ops: json_col(row, 5)?,
        status: text_col(row, 6)?,
        apply_user: row.get(7)?,
        reason: row.get(8)?,
        reviewed_by: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl GrantStore for SqliteStore {
    fn find_grant(
        &self,
        resource_type: ResourceType,
        resource_id: i64,
        app_id: AppId,
    ) -> Result<Option<Grant>> {
        let conn = self.conn.lock();
        let grant = conn
            .query_row(
                &format!(
                    "SELECT {} FROM grants
                     WHERE resource_type = ?1 AND resource_id = ?2 AND app_id = ?3",
                    GRANT_COLUMNS
                ),
                params![resource_type.as_str(), resource_id, app_id],
                row_to_grant,
            )
            .optional()?;
        Ok(grant)
    }

    fn grants_for_resource(&self, resource_type: ResourceType, resource_id: i64) -> Result<Vec<Grant>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM grants WHERE resource_type = ?1 AND resource_id = ?2 ORDER BY id",
            GRANT_COLUMNS
        ))?;
        let grants = stmt
            .query_map(params![resource_type.as_str(), resource_id], row_to_grant)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(grants)
    }

    fn insert_grant(&self, g: &Grant) -> Result<i64> {
        let ops = to_json(&g.ops)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO grants (resource_type, resource_id, app_id, capability, ops, status,
                                 apply_user, reason, reviewed_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                g.resource_type.as_str(),
                g.resource_id,
                g.app_id,
                g.capability.as_stored(),
                ops,
                g.status.as_str(),
                g.apply_user,
                g.reason,
                g.reviewed_by,
                g.created_at,
                g.updated_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_grant(&self, id: i64, patch: &GrantPatch) -> Result<()> {
        let mut updates = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(capability) = patch.capability {
            updates.push("capability = ?");
            params.push(Box::new(capability.as_stored()));
        }
        if let Some(ops) = &patch.ops {
            updates.push("ops = ?");
            params.push(Box::new(to_json(ops)?));
        }
        if let Some(status) = patch.status {
            updates.push("status = ?");
            params.push(Box::new(status.as_str()));
        }
        if let Some(apply_user) = patch.apply_user {
            updates.push("apply_user = ?");
            params.push(Box::new(apply_user));
        }
        if let Some(reason) = &patch.reason {
            updates.push("reason = ?");
            params.push(Box::new(reason.clone()));
        }
        if let Some(reviewed_by) = patch.reviewed_by {
            updates.push("reviewed_by = ?");
            params.push(Box::new(reviewed_by));
        }
        if let Some(updated_at) = patch.updated_at {
            updates.push("updated_at = ?");
            params.push(Box::new(updated_at));
        }

        let conn = self.conn.lock();
        execute_update(&conn, "grants", "id", id, updates, params)
    }

    fn list_grants(
        &self,
        resource_type: ResourceType,
        resource_id: i64,
        apps: Option<&[AppId]>,
        page: PageRequest,
    ) -> Result<Page<Grant>> {
        let mut params: Vec<Box<dyn ToSql>> =
            vec![Box::new(resource_type.as_str()), Box::new(resource_id)];
        let mut from_where = "FROM grants WHERE resource_type = ? AND resource_id = ?".to_string();

        if let Some(apps) = apps {
            if apps.is_empty() {
                return Ok(Page::new(Vec::new(), 0, page));
            }
            from_where.push_str(&format!(" AND app_id IN ({})", placeholders(apps.len())));
            for app in apps {
                params.push(Box::new(*app));
            }
        }

        let conn = self.conn.lock();
        paged(&conn, &from_where, GRANT_COLUMNS, params, page, row_to_grant)
    }

    fn list_app_grants(
        &self,
        resource_type: ResourceType,
        app_id: AppId,
        keyword: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<Grant>> {
        let mut params: Vec<Box<dyn ToSql>> =
            vec![Box::new(resource_type.as_str()), Box::new(app_id)];
        let mut from_where = "FROM grants WHERE resource_type = ? AND app_id = ?".to_string();

        if let Some(keyword) = keyword {
            let names = match resource_type {
                ResourceType::Database => "databases",
                ResourceType::Table => "tables",
            };
            from_where.push_str(&format!(
                " AND resource_id IN (SELECT id FROM {} WHERE name LIKE ? ESCAPE '\\')",
                names
            ));
            params.push(Box::new(like_pattern(keyword)));
        }

        let conn = self.conn.lock();
        paged(&conn, &from_where, GRANT_COLUMNS, params, page, row_to_grant)
    }
}

// ============================================================================
// Extensions and chains
// ============================================================================

const NODE_COLUMNS: &str = "id, table_id, kind, stage, extension_id, extension_version, front, \
                            enabled, schedule_config, config, description";

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<ChainNode> {
    Ok(ChainNode {
        id: row.get(0)?,
        table_id: row.get(1)?,
        kind: text_col(row, 2)?,
        stage: text_col(row, 3)?,
        extension_id: row.get(4)?,
        extension_version: row.get(5)?,
        front: row.get(6)?,
        enabled: row.get(7)?,
        schedule_config: json_col(row, 8)?,
        config: json_col(row, 9)?,
        description: row.get(10)?,
    })
}

impl ChainStore for SqliteStore {
    fn get_extension(&self, kind: ExtensionKind, id: i64) -> Result<Option<Extension>> {
        let conn = self.conn.lock();
        let ext = conn
            .query_row(
                "SELECT id, kind, name, versions, stages, online FROM extensions
                 WHERE id = ?1 AND kind = ?2",
                params![id, kind.as_str()],
                |row| {
                    Ok(Extension {
                        id: row.get(0)?,
                        kind: text_col(row, 1)?,
                        name: row.get(2)?,
                        versions: json_col(row, 3)?,
                        stages: json_col(row, 4)?,
                        online: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(ext)
    }

    fn insert_extension(&self, ext: &Extension) -> Result<i64> {
        let versions = to_json(&ext.versions)?;
        let stages = to_json(&ext.stages)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO extensions (kind, name, versions, stages, online) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ext.kind.as_str(), ext.name, versions, stages, ext.online],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_node(&self, id: NodeId) -> Result<Option<ChainNode>> {
        let conn = self.conn.lock();
        let node = conn
            .query_row(
                &format!("SELECT {} FROM chain_nodes WHERE id = ?1", NODE_COLUMNS),
                [id],
                row_to_node,
            )
            .optional()?;
        Ok(node)
    }

    fn chain_nodes(&self, key: &ChainKey) -> Result<Vec<ChainNode>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chain_nodes WHERE table_id = ?1 AND kind = ?2 AND stage = ?3 ORDER BY id",
            NODE_COLUMNS
        ))?;
        let nodes = stmt
            .query_map(
                params![key.table_id, key.kind.as_str(), key.stage.as_str()],
                row_to_node,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    fn insert_node(&self, node: &ChainNode, now: i64) -> Result<NodeId> {
        let schedule_config = to_json(&node.schedule_config)?;
        let config = to_json(&node.config)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chain_nodes (table_id, kind, stage, extension_id, extension_version, front,
                                      enabled, schedule_config, config, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                node.table_id,
                node.kind.as_str(),
                node.stage.as_str(),
                node.extension_id,
                node.extension_version,
                node.front,
                node.enabled,
                schedule_config,
                config,
                node.description,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn set_node_front(&self, id: NodeId, front: NodeId, now: i64) -> Result<()> {
        debug!(node_id = id, front, "Rewriting chain front");
        let conn = self.conn.lock();
        execute_update(
            &conn,
            "chain_nodes",
            "id",
            id,
            vec!["front = ?", "updated_at = ?"],
            vec![Box::new(front), Box::new(now)],
        )
    }

    fn update_node(&self, id: NodeId, patch: &NodePatch, now: i64) -> Result<()> {
        let mut updates = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(stage) = patch.stage {
            updates.push("stage = ?");
            params.push(Box::new(stage.as_str()));
        }
        if let Some(front) = patch.front {
            updates.push("front = ?");
            params.push(Box::new(front));
        }
        if let Some(version) = patch.extension_version {
            updates.push("extension_version = ?");
            params.push(Box::new(version));
        }
        if let Some(enabled) = patch.enabled {
            updates.push("enabled = ?");
            params.push(Box::new(enabled));
        }
        if let Some(schedule_config) = &patch.schedule_config {
            updates.push("schedule_config = ?");
            params.push(Box::new(to_json(schedule_config)?));
        }
        if let Some(config) = &patch.config {
            updates.push("config = ?");
            params.push(Box::new(to_json(config)?));
        }
        if let Some(description) = &patch.description {
            updates.push("description = ?");
            params.push(Box::new(description.clone()));
        }
        if !updates.is_empty() {
            updates.push("updated_at = ?");
            params.push(Box::new(now));
        }

        let conn = self.conn.lock();
        execute_update(&conn, "chain_nodes", "id", id, updates, params)
    }

    fn delete_node(&self, id: NodeId) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM chain_nodes WHERE id = ?1", [id])?;
        if rows == 0 {
            return Err(ControlError::NotFound(format!("chain node {} not found", id)));
        }
        Ok(())
    }
}

// ============================================================================
// Search index
// ============================================================================

impl SearchIndexStore for SqliteStore {
    fn upsert_keywords(&self, rows: &[SearchKeyword]) -> Result<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO search_keywords
                   (kind, subject_id, subject_name, field, key, content, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, CURRENT_TIMESTAMP)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.kind.as_str(),
                    row.subject_id,
                    row.subject_name,
                    row.field,
                    row.key,
                    row.content,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn keywords_for(&self, kind: SearchKind, subject_id: i64) -> Result<Vec<SearchKeyword>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, subject_id, subject_name, field, key, content FROM search_keywords
             WHERE kind = ?1 AND subject_id = ?2 ORDER BY field, key",
        )?;
        let rows = stmt
            .query_map(params![kind.as_str(), subject_id], |row| {
                Ok(SearchKeyword {
                    kind: text_col(row, 0)?,
                    subject_id: row.get(1)?,
                    subject_name: row.get(2)?,
                    field: row.get(3)?,
                    key: row.get(4)?,
                    content: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
