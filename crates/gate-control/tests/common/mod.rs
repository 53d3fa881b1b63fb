//! Shared fixture: one workspace, product, database and table owned by
//! [`OWNER`], over an in-memory store and a manual clock.

#![allow(dead_code)]

use chrono::Duration;
use std::sync::Arc;
use tablegate_control::{ControlConfig, ControlPlane, WorkspaceContext};
use tablegate_core::clock::{Clock, ManualClock};
use tablegate_core::{Database, ExpireType, MemberRole, Scope, TableInfo, UserId};
use tablegate_storage::SqliteStore;

pub const OWNER: UserId = 1;
pub const DEV: UserId = 2;
pub const OUTSIDER: UserId = 3;
pub const APPLICANT: UserId = 4;

pub const START: i64 = 1_700_000_000;
pub const DAY: i64 = 86_400;

pub struct Fixture {
    pub plane: ControlPlane<SqliteStore>,
    pub clock: Arc<ManualClock>,
    pub workspace: Scope,
    pub product: Scope,
    pub database: Database,
    pub table: TableInfo,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(ControlConfig::default())
    }

    pub fn with_config(config: ControlConfig) -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::at_unix(START));
        let plane = ControlPlane::new(store, config)
            .unwrap()
            .with_clock(clock.clone());

        let workspace = plane
            .create_workspace(OWNER, "analytics", "shared analytics", &[])
            .unwrap();
        let plane = plane.with_workspace(WorkspaceContext {
            id: workspace.id,
            name: workspace.name.clone(),
        });

        let product = plane
            .create_product(OWNER, "orders", "order facts", &[])
            .unwrap();
        let database = plane
            .create_database(OWNER, product.id, "orders_db", &[])
            .unwrap();
        let table = plane
            .create_table(OWNER, database.id, "orders_daily")
            .unwrap();

        Self {
            plane,
            clock,
            workspace,
            product,
            database,
            table,
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.unix()
    }

    /// Move the clock to `ts`.
    pub fn set_time(&self, ts: i64) {
        self.clock.advance(Duration::seconds(ts - self.now()));
    }

    /// Add `user` to the product as a permanent joined member.
    pub fn join_product(&self, user: UserId, role: MemberRole) {
        self.plane
            .product_members()
            .invite(OWNER, user, self.product.id, Some(role), ExpireType::Permanent)
            .unwrap();
    }

    /// Add `user` to the workspace as a permanent joined member.
    pub fn join_workspace(&self, user: UserId) {
        self.plane
            .workspace_members()
            .invite(OWNER, user, self.workspace.id, None, ExpireType::Permanent)
            .unwrap();
    }
}

pub fn ops(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}
