//! Tablegate admin CLI
//!
//! Operator commands over the control plane: catalog bootstrap, membership,
//! access grants and table pipeline chains. Every command prints JSON.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tablegate_control::{AttachRequest, ControlConfig, ControlPlane, Grants, IndexQueue, Memberships, UpdateRequest};
use tablegate_core::grant::{DatabaseGrants, GrantPolicy, TableGrants};
use tablegate_core::membership::{ProductScope, ScopePolicy, WorkspaceScope};
use tablegate_core::schema;
use tablegate_core::{
    AppId, Capability, ChainKey, ControlError, ExpireType, Extension, ExtensionKind, MemberRole,
    NodeId, OnlineStatus, PageRequest, Result, StageType, UserId,
};
use tablegate_storage::SqliteStore;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tablegate")]
#[command(version, about = "Tablegate control plane CLI", long_about = None)]
struct Cli {
    /// Path to the control plane database
    #[arg(long, global = true, env = ControlConfig::ENV_DB_PATH)]
    db: Option<PathBuf>,

    /// Current workspace id
    #[arg(long, global = true, env = ControlConfig::ENV_WORKSPACE_ID)]
    workspace: Option<i64>,

    /// User id the command runs as
    #[arg(long = "as", global = true, env = "TABLEGATE_USER", default_value_t = 0)]
    as_user: UserId,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new store
    Init {
        /// Remove an existing store first
        #[arg(short, long)]
        force: bool,
    },

    /// Print the store's identity stamp and schema version
    Info,

    /// Create a workspace
    Workspace(ScopeArgs),

    /// Create a product in the current workspace
    Product(ScopeArgs),

    /// Create a database under a product
    Database {
        product: i64,
        name: String,
        /// Additional database manager (repeatable)
        #[arg(long = "manager")]
        managers: Vec<UserId>,
    },

    /// Create a table under a database
    Table { database: i64, name: String },

    /// Register or update applications
    App {
        #[command(subcommand)]
        action: AppAction,
    },

    /// Register a filter or plugin
    Extension {
        kind: ExtensionKind,
        name: String,
        /// Supported versions, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        versions: Vec<i32>,
        /// Stages it may run at, comma separated (default: all)
        #[arg(long, value_delimiter = ',')]
        stages: Vec<StageType>,
        /// Register it offline
        #[arg(long)]
        offline: bool,
    },

    /// Workspace and product membership
    Member {
        scope: ScopeKind,
        #[command(subcommand)]
        action: MemberAction,
    },

    /// Application access grants
    Grant {
        resource: ResourceKind,
        #[command(subcommand)]
        action: GrantAction,
    },

    /// Which of your applications can read a table, and how
    Access {
        table: i64,
        /// Only applications whose name or id contains this
        #[arg(long)]
        keyword: Option<String>,
    },

    /// Which of your applications have requested a database
    DbAccess {
        database: i64,
        #[arg(long)]
        keyword: Option<String>,
    },

    /// Table filter and plugin chains
    Chain {
        #[command(subcommand)]
        action: ChainAction,
    },
}

#[derive(Args)]
struct ScopeArgs {
    name: String,
    #[arg(long, default_value = "")]
    intro: String,
    /// Additional manager (repeatable)
    #[arg(long = "manager")]
    managers: Vec<UserId>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeKind {
    Workspace,
    Product,
}

#[derive(Clone, Copy, ValueEnum)]
enum ResourceKind {
    Database,
    Table,
}

#[derive(Subcommand)]
enum AppAction {
    Create(ScopeArgs),
    /// Take an application online or offline
    Status { app: AppId, status: OnlineStatus },
}

#[derive(Subcommand)]
enum MemberAction {
    /// Apply to join, or renew near expiry
    Apply {
        scope_id: i64,
        #[arg(long)]
        role: Option<MemberRole>,
        /// Expiry code: 0 permanent, 1 one month, 2 three months, 3 half year, 4 one year
        #[arg(long, default_value_t = 0)]
        expire: i64,
    },
    /// Accept or reject a pending application
    Approve {
        scope_id: i64,
        user: UserId,
        #[arg(long)]
        reject: bool,
    },
    /// Request a different role as an existing member
    RoleChange { scope_id: i64, role: MemberRole },
    /// Accept or reject a pending role change
    ApproveRoleChange {
        scope_id: i64,
        user: UserId,
        #[arg(long)]
        reject: bool,
    },
    /// Add a member directly, or extend a member near expiry
    Invite {
        scope_id: i64,
        user: UserId,
        #[arg(long)]
        role: Option<MemberRole>,
        /// Expiry code, as for `apply`
        #[arg(long, default_value_t = 0)]
        expire: i64,
    },
    /// Replace the scope's manager list
    Managers {
        scope_id: i64,
        #[arg(value_delimiter = ',', required = true)]
        users: Vec<UserId>,
    },
    /// Your role and status as shown to you
    Show { scope_id: i64 },
    /// Remove a member
    Remove {
        scope_id: i64,
        user: UserId,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// List members visible to the caller
    List {
        scope_id: i64,
        #[command(flatten)]
        page: PageArgs,
    },
}

#[derive(Subcommand)]
enum GrantAction {
    /// Request access for an application
    Request {
        app: AppId,
        resource_id: i64,
        /// Database root scope (all_privileges, table_data_only, none) or
        /// table mode (query_all, restricted)
        capability: String,
        /// Operations, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        ops: Vec<String>,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Accept or reject a pending request
    Approve {
        app: AppId,
        resource_id: i64,
        #[arg(long)]
        reject: bool,
    },
    /// Withdraw your own request
    Withdraw {
        app: AppId,
        resource_id: i64,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Change capability and ops without review
    Edit {
        app: AppId,
        resource_id: i64,
        capability: String,
        #[arg(long, value_delimiter = ',', required = true)]
        ops: Vec<String>,
    },
    /// Switch a grant online or offline without review
    Enable {
        app: AppId,
        resource_id: i64,
        status: OnlineStatus,
    },
    /// List grants on a resource
    List {
        resource_id: i64,
        #[command(flatten)]
        page: PageArgs,
    },
    /// List one application's grants across resources
    ForApp {
        app: AppId,
        /// Only resources whose name contains this
        #[arg(long)]
        keyword: Option<String>,
        #[command(flatten)]
        page: PageArgs,
    },
}

#[derive(Subcommand)]
enum ChainAction {
    /// Attach a node after `--after` (0 for the head)
    Attach {
        table: i64,
        kind: ExtensionKind,
        stage: StageType,
        extension: i64,
        #[arg(long = "ext-version", default_value_t = 1)]
        ext_version: i32,
        #[arg(long, default_value_t = 0)]
        after: NodeId,
        /// Node config as JSON
        #[arg(long)]
        config: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Move a node to another position or stage
    Move {
        node: NodeId,
        #[arg(long)]
        stage: Option<StageType>,
        #[arg(long)]
        after: Option<NodeId>,
    },
    /// Detach a node
    Detach { node: NodeId },
    /// Print every stage's chain for a table
    Show { table: i64, kind: ExtensionKind },
    /// Report structural problems in one chain
    Verify {
        table: i64,
        kind: ExtensionKind,
        stage: StageType,
    },
}

#[derive(Args)]
struct PageArgs {
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    size: u32,
}

impl PageArgs {
    fn request(&self) -> PageRequest {
        PageRequest::new(self.page, self.size)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error [{}]: {}", e.code(), e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<ControlConfig> {
    let mut config = ControlConfig::from_env()?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if cli.workspace.is_some() {
        config.workspace_id = cli.workspace;
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Init { force } => return init_store(&config.db_path, *force),
        Commands::Info => return info(&config.db_path),
        _ => {}
    }

    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let (indexer, worker) = IndexQueue::spawn(store.clone(), &config);
    let plane = ControlPlane::new(store, config)?.with_indexer(indexer);

    let result = dispatch(&plane, cli.as_user, cli.command);

    // The worker exits once the plane's sender is gone and the queue drains.
    drop(plane);
    if let Err(e) = worker.await {
        warn!(error = %e, "Index worker aborted");
    }
    result
}

fn init_store(path: &Path, force: bool) -> Result<()> {
    if path.exists() {
        if !force {
            return Err(ControlError::Config(format!(
                "Store already exists at '{}'. Use --force to overwrite.",
                path.display()
            )));
        }
        eprintln!("Removing existing store at '{}'", path.display());
        std::fs::remove_file(path).map_err(|e| {
            ControlError::Other(format!("Failed to remove {}: {}", path.display(), e))
        })?;
    }

    SqliteStore::open(path)?;
    eprintln!("Initialized store at '{}'", path.display());
    Ok(())
}

fn info(path: &Path) -> Result<()> {
    let store = SqliteStore::open(path)?;
    let stamp = store.with_connection(|conn| {
        schema::read_store_info(conn)?
            .ok_or_else(|| ControlError::Config(format!("{} is not stamped", path.display())))
    })?;
    emit(&stamp)
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn dispatch(plane: &ControlPlane<SqliteStore>, user: UserId, command: Commands) -> Result<()> {
    match command {
        Commands::Init { .. } | Commands::Info => Ok(()),
        Commands::Workspace(args) => {
            emit(&plane.create_workspace(user, &args.name, &args.intro, &args.managers)?)
        }
        Commands::Product(args) => {
            emit(&plane.create_product(user, &args.name, &args.intro, &args.managers)?)
        }
        Commands::Database {
            product,
            name,
            managers,
        } => emit(&plane.create_database(user, product, &name, &managers)?),
        Commands::Table { database, name } => emit(&plane.create_table(user, database, &name)?),
        Commands::App { action } => match action {
            AppAction::Create(args) => {
                emit(&plane.create_application(user, &args.name, &args.intro, &args.managers)?)
            }
            AppAction::Status { app, status } => {
                emit(&plane.set_application_status(user, app, status)?)
            }
        },
        Commands::Extension {
            kind,
            name,
            versions,
            stages,
            offline,
        } => emit(&plane.pipeline().register_extension(Extension {
            id: 0,
            kind,
            name,
            versions,
            stages,
            online: !offline,
        })?),
        Commands::Member { scope, action } => match scope {
            ScopeKind::Workspace => member(plane.memberships::<WorkspaceScope>(), user, action),
            ScopeKind::Product => member(plane.memberships::<ProductScope>(), user, action),
        },
        Commands::Grant { resource, action } => match resource {
            ResourceKind::Database => grant(plane.grants::<DatabaseGrants>(), user, action),
            ResourceKind::Table => grant(plane.grants::<TableGrants>(), user, action),
        },
        Commands::Access { table, keyword } => {
            emit(&plane.app_can_access_table(user, table, keyword.as_deref())?)
        }
        Commands::DbAccess { database, keyword } => {
            emit(&plane.app_can_access_database(user, database, keyword.as_deref())?)
        }
        Commands::Chain { action } => chain(plane, user, action),
    }
}

fn member<P: ScopePolicy>(
    members: Memberships<'_, SqliteStore, P>,
    user: UserId,
    action: MemberAction,
) -> Result<()> {
    match action {
        MemberAction::Apply {
            scope_id,
            role,
            expire,
        } => emit(&members.apply(user, scope_id, role, ExpireType::from_code(expire)?)?),
        MemberAction::Approve {
            scope_id,
            user: applicant,
            reject,
        } => emit(&members.approve(user, applicant, scope_id, !reject)?),
        MemberAction::RoleChange { scope_id, role } => {
            emit(&members.apply_role_change(user, scope_id, role)?)
        }
        MemberAction::ApproveRoleChange {
            scope_id,
            user: target,
            reject,
        } => emit(&members.approve_role_change(user, target, scope_id, !reject)?),
        MemberAction::Invite {
            scope_id,
            user: target,
            role,
            expire,
        } => emit(&members.invite(user, target, scope_id, role, ExpireType::from_code(expire)?)?),
        MemberAction::Managers { scope_id, users } => {
            emit(&members.maintain_managers(user, scope_id, &users)?)
        }
        MemberAction::Show { scope_id } => emit(&members.display(user, scope_id)?),
        MemberAction::Remove {
            scope_id,
            user: target,
            reason,
        } => emit(&members.remove(user, target, scope_id, &reason)?),
        MemberAction::List { scope_id, page } => {
            emit(&members.list(user, scope_id, page.request())?)
        }
    }
}

fn grant<P: GrantPolicy>(grants: Grants<'_, SqliteStore, P>, user: UserId, action: GrantAction) -> Result<()> {
    match action {
        GrantAction::Request {
            app,
            resource_id,
            capability,
            ops,
            reason,
        } => {
            let capability = Capability::parse(P::RESOURCE, &capability)?;
            emit(&grants.request(user, app, resource_id, capability, &ops, &reason)?)
        }
        GrantAction::Approve {
            app,
            resource_id,
            reject,
        } => emit(&grants.approve(user, app, resource_id, !reject)?),
        GrantAction::Withdraw {
            app,
            resource_id,
            reason,
        } => emit(&grants.withdraw(user, app, resource_id, &reason)?),
        GrantAction::Edit {
            app,
            resource_id,
            capability,
            ops,
        } => {
            let capability = Capability::parse(P::RESOURCE, &capability)?;
            emit(&grants.edit(user, app, resource_id, capability, &ops)?)
        }
        GrantAction::Enable {
            app,
            resource_id,
            status,
        } => emit(&grants.set_enabled(user, app, resource_id, status)?),
        GrantAction::List { resource_id, page } => {
            emit(&grants.list(user, resource_id, page.request())?)
        }
        GrantAction::ForApp { app, keyword, page } => {
            emit(&grants.list_for_app(user, app, keyword.as_deref(), page.request())?)
        }
    }
}

fn chain(plane: &ControlPlane<SqliteStore>, user: UserId, action: ChainAction) -> Result<()> {
    let pipeline = plane.pipeline();
    match action {
        ChainAction::Attach {
            table,
            kind,
            stage,
            extension,
            ext_version,
            after,
            config,
            description,
        } => {
            let mut request = AttachRequest::new(table, kind, extension, ext_version, stage).after(after);
            if let Some(config) = config {
                request.config = serde_json::from_str(&config)?;
            }
            request.description = description;
            emit(&pipeline.attach(user, request)?)
        }
        ChainAction::Move { node, stage, after } => emit(&pipeline.update(
            user,
            node,
            UpdateRequest {
                stage,
                front: after,
                ..Default::default()
            },
        )?),
        ChainAction::Detach { node } => emit(&pipeline.detach(user, node)?),
        ChainAction::Show { table, kind } => emit(&pipeline.table_chains(table, kind)?),
        ChainAction::Verify { table, kind, stage } => {
            let key = ChainKey {
                table_id: table,
                kind,
                stage,
            };
            emit(&pipeline.verify(key)?)
        }
    }
}
