// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::app::errors::AppResult;
use crate::app::types::{
    AccountRecord, InterfaceRecord, NewAccount, NewServer, NewUser, NicProbe, ServerAccount,
    ServerRecord, ServerStatus, SyncTarget, UserRecord, UserStatus,
};

/// Shared-store boundary. The web layer writes desired state through the same
/// contract; the engine only writes status fields, collected facts, and the
/// account rows its fleet policies create.
///
/// Mutations of desired state (`set_account_desired`, `set_user_public_key`)
/// reset the affected accounts to DIRTY themselves; callers never have to
/// remember that side effect.
#[async_trait]
pub trait FleetStorePort: Send + Sync {
    // Users.
    async fn insert_user(&self, user: &NewUser) -> AppResult<i64>;
    async fn get_user(&self, id: i64) -> AppResult<Option<UserRecord>>;
    async fn list_users(&self) -> AppResult<Vec<UserRecord>>;
    async fn count_users(&self) -> AppResult<i64>;
    async fn set_user_status(&self, id: i64, status: UserStatus) -> AppResult<()>;
    /// Replaces the user's key set and marks every account of the user DIRTY.
    async fn set_user_public_key(&self, id: i64, public_key: &str) -> AppResult<()>;

    // Servers.
    async fn upsert_server(&self, server: &NewServer) -> AppResult<i64>;
    async fn get_server(&self, id: i64) -> AppResult<Option<ServerRecord>>;
    async fn list_servers(&self) -> AppResult<Vec<ServerRecord>>;
    async fn set_server_status(&self, id: i64, status: ServerStatus) -> AppResult<()>;
    async fn set_server_facts(
        &self,
        id: i64,
        kernel_version: &str,
        os_version: &str,
    ) -> AppResult<()>;
    async fn mark_server_collected(&self, id: i64, at: OffsetDateTime) -> AppResult<()>;
    /// Insert or update by (server, pci_address); the collector never deletes.
    async fn upsert_interface(&self, server_id: i64, probe: &NicProbe) -> AppResult<i64>;
    async fn list_interfaces(&self, server_id: i64) -> AppResult<Vec<InterfaceRecord>>;

    // Accounts.
    async fn insert_account(&self, account: &NewAccount) -> AppResult<i64>;
    async fn get_account(&self, id: i64) -> AppResult<Option<AccountRecord>>;
    async fn list_accounts(&self) -> AppResult<Vec<AccountRecord>>;
    async fn list_dirty_accounts(&self) -> AppResult<Vec<AccountRecord>>;
    async fn list_login_accounts_for_server(
        &self,
        server_id: i64,
    ) -> AppResult<Vec<ServerAccount>>;
    /// Writes desired state and resets status to DIRTY.
    async fn set_account_desired(
        &self,
        id: i64,
        is_login_able: bool,
        is_sudo: bool,
    ) -> AppResult<()>;
    async fn mark_account_updating(&self, id: i64) -> AppResult<bool>;
    /// Conditional write-back after a convergence attempt: the transition is
    /// applied only while the stored status is still UPDATING, so a DIRTY
    /// re-mark that raced the attempt is never clobbered. Returns whether the
    /// transition was applied.
    async fn finish_account(&self, id: i64, success: bool) -> AppResult<bool>;
    /// Applies the monotonic rule: the stored value moves only if `at` is
    /// strictly newer. Returns whether it moved.
    async fn advance_last_login(&self, id: i64, at: OffsetDateTime) -> AppResult<bool>;
    /// Startup recovery: accounts stuck UPDATING from a previous run go back
    /// to DIRTY. Returns how many rows moved.
    async fn reset_updating_accounts(&self) -> AppResult<u64>;
    /// Eager snapshot of (account, server, proxy server, user), detached from
    /// the store, for handing to a convergence task by value.
    async fn load_sync_target(&self, account_id: i64) -> AppResult<Option<SyncTarget>>;
}
