//! Records and enums shared by the store and the engines.
//!
//! Enums are persisted as lowercase TEXT and parsed back with `FromStr`;
//! the numeric `code()` values are what the admin facade reports.

use crate::{ControlError, Result};
use serde::{Deserialize, Serialize};

/// Identifier of a user, as issued by the identity system
pub type UserId = u64;
/// Identifier of an application, assigned at registration
pub type AppId = u64;
/// Row id of a chain node. `0` is never a node; as a front it marks the head.
pub type NodeId = i64;

/// Generates `as_str`, `Display`, and `FromStr` for a text-backed enum.
macro_rules! text_enum {
    ($name:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ControlError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ControlError::InvalidParam(format!(
                        concat!("Unknown ", $what, ": {}"),
                        s
                    ))),
                }
            }
        }
    };
}

// ============================================================================
// Scopes and catalog resources
// ============================================================================

/// Kind of administrative scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    /// Top-level tenant; applications and products live in one
    Workspace,
    /// Group of databases inside a workspace
    Product,
}

text_enum!(ScopeType, "scope type", {
    Workspace => "workspace",
    Product => "product",
});

/// Availability of a scope, resource or application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlineStatus {
    /// In service
    #[default]
    Online,
    /// Kept but disabled; offline applications are not access candidates
    Offline,
}

text_enum!(OnlineStatus, "online status", {
    Online => "online",
    Offline => "offline",
});

impl OnlineStatus {
    /// Numeric code reported by the admin facade
    pub fn code(&self) -> i8 {
        match self {
            OnlineStatus::Online => 1,
            OnlineStatus::Offline => 2,
        }
    }
}

/// A workspace or product: the two scopes that carry members and managers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    /// Row id, unique across both scope types
    pub id: i64,
    /// Workspace or product
    pub scope_type: ScopeType,
    /// Name, unique within the scope type
    pub name: String,
    /// Free-text introduction
    pub intro: String,
    /// User who created the scope; always among the managers at creation
    pub creator: UserId,
    /// Users listed as managers. Listing alone does not make a manager: the
    /// user also needs an active, unexpired membership.
    pub managers: Vec<UserId>,
    /// Whether the scope is in service
    pub status: OnlineStatus,
}

impl Scope {
    /// True if `user` is listed. See [`Scope::managers`].
    pub fn is_manager(&self, user: UserId) -> bool {
        self.managers.contains(&user)
    }
}

/// A database registered under a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    /// Row id
    pub id: i64,
    /// Database name
    pub name: String,
    /// Owning product
    pub product_id: i64,
    /// Users who manage the database in addition to the product's managers.
    /// They must be product members.
    pub managers: Vec<UserId>,
    /// Whether the database is in service
    pub status: OnlineStatus,
}

impl Database {
    pub fn is_manager(&self, user: UserId) -> bool {
        self.managers.contains(&user)
    }
}

/// A table registered under a database. Tables carry no manager list of
/// their own; they inherit the database's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: i64,
    pub name: String,
    /// Owning database
    pub database_id: i64,
    pub status: OnlineStatus,
}

/// A client identity that requests grants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    /// Pre-assigned application id
    pub app_id: AppId,
    /// Display name
    pub name: String,
    /// Free-text introduction
    pub intro: String,
    /// Workspace member who registered the application
    pub creator: UserId,
    /// Users who may request and withdraw grants for this application
    pub managers: Vec<UserId>,
    /// Offline applications drop out of the access partitions
    pub status: OnlineStatus,
}

impl Application {
    pub fn is_manager(&self, user: UserId) -> bool {
        self.managers.contains(&user)
    }
}

// ============================================================================
// Membership
// ============================================================================

/// Role stored on a membership row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    /// The only workspace role
    Member,
    /// Product role for builders
    Developer,
    /// Product role for operators
    Operator,
}

text_enum!(MemberRole, "member role", {
    Member => "member",
    Developer => "developer",
    Operator => "operator",
});

impl MemberRole {
    pub fn code(&self) -> i8 {
        match self {
            MemberRole::Member => 1,
            MemberRole::Developer => 2,
            MemberRole::Operator => 3,
        }
    }
}

/// Lifecycle state of a membership row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// No application on record
    NotApplied,
    /// First application waiting for a manager
    PendingApproval,
    /// Renewal requested from inside the renewal window; still active
    PendingRenewal,
    /// Product role change requested; still active under the old role
    PendingRoleChange,
    /// Approved and active until `expire_time`
    Joined,
    /// Application rejected
    Rejected,
    /// Removed by a manager
    Quit,
    /// Reported only. Expiry is derived from `expire_time` at read time and
    /// never stored.
    Expired,
}

text_enum!(MemberStatus, "member status", {
    NotApplied => "not_applied",
    PendingApproval => "pending_approval",
    PendingRenewal => "pending_renewal",
    PendingRoleChange => "pending_role_change",
    Joined => "joined",
    Rejected => "rejected",
    Quit => "quit",
    Expired => "expired",
});

impl MemberStatus {
    /// Status code as reported for a given scope.
    ///
    /// Workspaces and products number the tail of the state list differently.
    pub fn code(&self, scope: ScopeType) -> i8 {
        match (self, scope) {
            (MemberStatus::NotApplied, ScopeType::Workspace) => 3,
            (MemberStatus::NotApplied, ScopeType::Product) => 0,
            (MemberStatus::PendingApproval, _) => 1,
            (MemberStatus::PendingRenewal, _) => 2,
            (MemberStatus::PendingRoleChange, _) => 3,
            (MemberStatus::Joined, _) => 4,
            (MemberStatus::Rejected, _) => 5,
            (MemberStatus::Quit, _) => 6,
            (MemberStatus::Expired, ScopeType::Workspace) => 9,
            (MemberStatus::Expired, ScopeType::Product) => 7,
        }
    }

    /// True while a manager's decision is awaited on an application or renewal
    pub fn is_pending_approval(&self) -> bool {
        matches!(self, MemberStatus::PendingApproval | MemberStatus::PendingRenewal)
    }
}

/// How long an approved membership lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpireType {
    /// Never expires; `expire_time` stays 0
    #[default]
    Permanent,
    OneMonth,
    ThreeMonths,
    HalfYear,
    OneYear,
}

impl ExpireType {
    /// Wire code, also accepted by [`ExpireType::from_code`]
    pub fn code(&self) -> i8 {
        match self {
            ExpireType::Permanent => 0,
            ExpireType::OneMonth => 1,
            ExpireType::ThreeMonths => 2,
            ExpireType::HalfYear => 3,
            ExpireType::OneYear => 4,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(ExpireType::Permanent),
            1 => Ok(ExpireType::OneMonth),
            2 => Ok(ExpireType::ThreeMonths),
            3 => Ok(ExpireType::HalfYear),
            4 => Ok(ExpireType::OneYear),
            _ => Err(ControlError::InvalidParam(format!(
                "Unknown expire type: {}",
                code
            ))),
        }
    }

    /// Calendar months granted, or `None` for permanent.
    pub fn months(&self) -> Option<u32> {
        match self {
            ExpireType::Permanent => None,
            ExpireType::OneMonth => Some(1),
            ExpireType::ThreeMonths => Some(3),
            ExpireType::HalfYear => Some(6),
            ExpireType::OneYear => Some(12),
        }
    }
}

/// One row per (scope, user).
///
/// `expire_time == 0` means permanent. `pending_role` is only set while the
/// status is [`MemberStatus::PendingRoleChange`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    /// Row id; reused when a former member re-applies
    pub id: i64,
    pub scope_type: ScopeType,
    pub scope_id: i64,
    pub user_id: UserId,
    /// Current role. Workspace rows always hold [`MemberRole::Member`].
    pub role: MemberRole,
    pub status: MemberStatus,
    /// Unix seconds of the first approval, or of the application before it
    pub join_time: i64,
    /// Duration requested with the latest application or renewal
    pub expire_type: ExpireType,
    /// Unix seconds after which the membership lapses; 0 is permanent
    pub expire_time: i64,
    /// Unix seconds of removal; 0 while a member
    pub out_time: i64,
    /// Role requested by a pending role change
    pub pending_role: Option<MemberRole>,
}

/// Partial update of a membership row. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembershipPatch {
    pub role: Option<MemberRole>,
    pub status: Option<MemberStatus>,
    pub join_time: Option<i64>,
    pub expire_type: Option<ExpireType>,
    pub expire_time: Option<i64>,
    pub out_time: Option<i64>,
    /// `Some(None)` clears the pending role
    pub pending_role: Option<Option<MemberRole>>,
}

impl MembershipPatch {
    /// True if applying the patch would change nothing
    pub fn is_empty(&self) -> bool {
        *self == MembershipPatch::default()
    }
}

// ============================================================================
// Grants
// ============================================================================

/// Kind of resource a grant targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Database,
    Table,
}

text_enum!(ResourceType, "resource type", {
    Database => "database",
    Table => "table",
});

/// Lifecycle state of a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    /// Approved and in force
    Normal,
    /// Switched off by a resource manager
    Offline,
    /// Requested, waiting for review
    Checking,
    /// Withdrawn by its applicant
    Cancelled,
    /// Refused by a resource manager
    Rejected,
}

text_enum!(GrantStatus, "grant status", {
    Normal => "normal",
    Offline => "offline",
    Checking => "checking",
    Cancelled => "cancelled",
    Rejected => "rejected",
});

impl GrantStatus {
    /// Code reported when an app has never requested access.
    pub const UNREQUESTED_CODE: i8 = 0;
    /// Code reported when a database grant already covers a table.
    pub const IMPLICIT_CODE: i8 = 11;

    /// Numeric code reported by the admin facade
    pub fn code(&self) -> i8 {
        match self {
            GrantStatus::Normal => 1,
            GrantStatus::Offline => 2,
            GrantStatus::Checking => 3,
            GrantStatus::Cancelled => 4,
            GrantStatus::Rejected => 5,
        }
    }
}

/// Scope of a database-level grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseRoot {
    /// Every operation on every table, including DDL
    AllPrivileges,
    /// Data operations on every table
    TableDataOnly,
    /// Ops listed on the grant only
    None,
}

text_enum!(DatabaseRoot, "database root", {
    AllPrivileges => "all_privileges",
    TableDataOnly => "table_data_only",
    None => "none",
});

impl DatabaseRoot {
    pub fn code(&self) -> i8 {
        match self {
            DatabaseRoot::AllPrivileges => 1,
            DatabaseRoot::TableDataOnly => 2,
            DatabaseRoot::None => 3,
        }
    }

    /// True if a grant at this root covers every table in the database.
    pub fn covers_tables(&self) -> bool {
        matches!(self, DatabaseRoot::AllPrivileges | DatabaseRoot::TableDataOnly)
    }
}

/// What a grant allows, beyond its op list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "snake_case")]
pub enum Capability {
    /// Database grant at the given root scope
    Database { root: DatabaseRoot },
    /// Table grant; `query_all` lifts per-row restrictions
    Table { query_all: bool },
}

impl Capability {
    /// Resource kind this capability can be granted on
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Capability::Database { .. } => ResourceType::Database,
            Capability::Table { .. } => ResourceType::Table,
        }
    }

    /// Text stored in the `capability` column.
    pub fn as_stored(&self) -> &'static str {
        match self {
            Capability::Database { root } => root.as_str(),
            Capability::Table { query_all: true } => "query_all",
            Capability::Table { query_all: false } => "restricted",
        }
    }

    /// Parse the stored text back for a known resource type
    pub fn parse(resource_type: ResourceType, s: &str) -> Result<Self> {
        match resource_type {
            ResourceType::Database => Ok(Capability::Database { root: s.parse()? }),
            ResourceType::Table => match s {
                "query_all" => Ok(Capability::Table { query_all: true }),
                "restricted" => Ok(Capability::Table { query_all: false }),
                _ => Err(ControlError::InvalidParam(format!(
                    "Unknown table capability: {}",
                    s
                ))),
            },
        }
    }
}

/// One row per (resource, application).
///
/// A grant is never deleted. Withdrawn, rejected and offline rows are
/// reopened in place by the next request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    /// Row id
    pub id: i64,
    /// Database or table
    pub resource_type: ResourceType,
    /// Id of the database or table
    pub resource_id: i64,
    /// Application holding the grant
    pub app_id: AppId,
    /// Root scope or query-all flag; its kind matches `resource_type`
    pub capability: Capability,
    /// Normalized operation names, first-seen order
    pub ops: Vec<String>,
    pub status: GrantStatus,
    /// Application manager behind the latest request
    pub apply_user: UserId,
    /// Reason given with the latest request or withdrawal
    pub reason: String,
    /// Manager who last reviewed the grant; `None` until the first review
    pub reviewed_by: Option<UserId>,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds
    pub updated_at: i64,
}

/// Partial update of a grant row. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrantPatch {
    pub capability: Option<Capability>,
    pub ops: Option<Vec<String>>,
    pub status: Option<GrantStatus>,
    pub apply_user: Option<UserId>,
    pub reason: Option<String>,
    pub reviewed_by: Option<UserId>,
    pub updated_at: Option<i64>,
}

// ============================================================================
// Execution chains
// ============================================================================

/// Filters and plugins form separate chains on the same table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    Filter,
    Plugin,
}

text_enum!(ExtensionKind, "extension kind", {
    Filter => "filter",
    Plugin => "plugin",
});

/// When a chain runs relative to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    /// Before the request executes
    Pre,
    /// After it executes, before the response
    Post,
    /// After the response, asynchronously
    Deferred,
}

text_enum!(StageType, "stage type", {
    Pre => "pre",
    Post => "post",
    Deferred => "deferred",
});

impl StageType {
    pub const ALL: [StageType; 3] = [StageType::Pre, StageType::Post, StageType::Deferred];
}

/// A registered filter or plugin that chain nodes instantiate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub id: i64,
    pub kind: ExtensionKind,
    /// Name, unique per kind
    pub name: String,
    /// Versions a node may pin
    pub versions: Vec<i32>,
    /// Stages this extension may run in; empty means all
    pub stages: Vec<StageType>,
    /// Offline extensions cannot be attached or re-pinned
    pub online: bool,
}

impl Extension {
    pub fn supports_version(&self, version: i32) -> bool {
        self.versions.contains(&version)
    }

    pub fn supports_stage(&self, stage: StageType) -> bool {
        self.stages.is_empty() || self.stages.contains(&stage)
    }
}

/// Identifies one chain: the nodes of a kind attached to a table at a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainKey {
    pub table_id: i64,
    pub kind: ExtensionKind,
    pub stage: StageType,
}

impl std::fmt::Display for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.table_id, self.kind, self.stage)
    }
}

/// One link in a chain. `front == 0` marks the head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainNode {
    pub id: NodeId,
    pub table_id: i64,
    pub kind: ExtensionKind,
    pub stage: StageType,
    /// Registered extension this node runs
    pub extension_id: i64,
    /// Pinned version; must be one the extension supports
    pub extension_version: i32,
    /// Id of the node this one runs after, 0 for the head
    pub front: NodeId,
    /// Disabled nodes keep their place but are skipped at run time
    pub enabled: bool,
    /// Opaque scheduling settings, used by deferred plugins
    pub schedule_config: serde_json::Value,
    /// Opaque extension settings
    pub config: serde_json::Value,
    pub description: String,
}

impl ChainNode {
    pub fn key(&self) -> ChainKey {
        ChainKey {
            table_id: self.table_id,
            kind: self.kind,
            stage: self.stage,
        }
    }
}

/// Fields written by a node update. `stage` and `front` are set only after
/// the chain splice that moves the node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub stage: Option<StageType>,
    pub front: Option<NodeId>,
    pub extension_version: Option<i32>,
    pub enabled: Option<bool>,
    pub schedule_config: Option<serde_json::Value>,
    pub config: Option<serde_json::Value>,
    pub description: Option<String>,
}

// ============================================================================
// Search index and paging
// ============================================================================

/// Subject kinds in the keyword index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchKind {
    Product,
    Database,
    Table,
}

text_enum!(SearchKind, "search kind", {
    Product => "product",
    Database => "database",
    Table => "table",
});

/// A denormalized keyword row. Unique on (kind, subject_id, field, key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchKeyword {
    pub kind: SearchKind,
    /// Id of the product, database or table
    pub subject_id: i64,
    /// Name shown with a hit
    pub subject_name: String,
    /// Which attribute the row indexes, e.g. `name` or `manager`
    pub field: String,
    /// Distinguishes rows of a multi-valued field, such as one per manager
    pub key: String,
    /// Searchable text
    pub content: String,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    pub const MAX_SIZE: u32 = 200;

    /// Clamps `page` to at least 1 and `size` to `1..=MAX_SIZE`.
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page: page.max(1),
            size: size.clamp(1, Self::MAX_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matching rows across all pages
    pub total: u64,
    pub total_pages: u64,
    pub page: u32,
    pub size: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, req: PageRequest) -> Self {
        let size = u64::from(req.size);
        Self {
            items,
            total,
            total_pages: total.div_ceil(size),
            page: req.page,
            size: req.size,
        }
    }
}
