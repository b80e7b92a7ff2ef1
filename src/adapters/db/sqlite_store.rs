// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::adapters::db::{FleetStore, FleetStoreError};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::FleetStorePort;
use crate::app::types::{
    AccountRecord, InterfaceRecord, NewAccount, NewServer, NewUser, NicProbe, ServerAccount,
    ServerRecord, ServerStatus, SyncTarget, UserRecord, UserStatus,
};

/// Outbound store adapter. This is the boundary where persistence errors
/// (FleetStoreError, sqlx) become app-level errors so the app core stays
/// free of DB details.
#[derive(Clone)]
pub struct SqliteFleetStore {
    store: Arc<FleetStore>,
}

impl SqliteFleetStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let store = FleetStore::open(path).await.map_err(map_store_error)?;
        Ok(Self {
            store: Arc::new(store),
        })
    }

    pub async fn open_memory() -> AppResult<Self> {
        let store = FleetStore::open_memory().await.map_err(map_store_error)?;
        Ok(Self {
            store: Arc::new(store),
        })
    }
}

fn map_store_error(err: FleetStoreError) -> AppError {
    match err {
        FleetStoreError::EmptyHost
        | FleetStoreError::EmptyUsername
        | FleetStoreError::EmptyAccountName => {
            AppError::with_message(AppErrorKind::InvalidArgument, codes::INVALID_ARGUMENT, err.to_string())
        }
        FleetStoreError::SelfProxy => AppError::with_message(
            AppErrorKind::Conflict,
            codes::CONFLICT,
            "server cannot proxy through itself",
        ),
        FleetStoreError::Sqlx(_) | FleetStoreError::TimeFormat(_) => {
            AppError::with_message(AppErrorKind::Internal, codes::INTERNAL_ERROR, err.to_string())
        }
    }
}

#[async_trait]
impl FleetStorePort for SqliteFleetStore {
    async fn insert_user(&self, user: &NewUser) -> AppResult<i64> {
        self.store.insert_user(user).await.map_err(map_store_error)
    }

    async fn get_user(&self, id: i64) -> AppResult<Option<UserRecord>> {
        self.store.get_user(id).await.map_err(map_store_error)
    }

    async fn list_users(&self) -> AppResult<Vec<UserRecord>> {
        self.store.list_users().await.map_err(map_store_error)
    }

    async fn count_users(&self) -> AppResult<i64> {
        self.store.count_users().await.map_err(map_store_error)
    }

    async fn set_user_status(&self, id: i64, status: UserStatus) -> AppResult<()> {
        self.store
            .set_user_status(id, status)
            .await
            .map_err(map_store_error)
    }

    async fn set_user_public_key(&self, id: i64, public_key: &str) -> AppResult<()> {
        self.store
            .set_user_public_key(id, public_key)
            .await
            .map_err(map_store_error)
    }

    async fn upsert_server(&self, server: &NewServer) -> AppResult<i64> {
        self.store
            .upsert_server(server)
            .await
            .map_err(map_store_error)
    }

    async fn get_server(&self, id: i64) -> AppResult<Option<ServerRecord>> {
        self.store.get_server(id).await.map_err(map_store_error)
    }

    async fn list_servers(&self) -> AppResult<Vec<ServerRecord>> {
        self.store.list_servers().await.map_err(map_store_error)
    }

    async fn set_server_status(&self, id: i64, status: ServerStatus) -> AppResult<()> {
        self.store
            .set_server_status(id, status)
            .await
            .map_err(map_store_error)
    }

    async fn set_server_facts(
        &self,
        id: i64,
        kernel_version: &str,
        os_version: &str,
    ) -> AppResult<()> {
        self.store
            .set_server_facts(id, kernel_version, os_version)
            .await
            .map_err(map_store_error)
    }

    async fn mark_server_collected(&self, id: i64, at: OffsetDateTime) -> AppResult<()> {
        self.store
            .mark_server_collected(id, at)
            .await
            .map_err(map_store_error)
    }

    async fn upsert_interface(&self, server_id: i64, probe: &NicProbe) -> AppResult<i64> {
        self.store
            .upsert_interface(server_id, probe)
            .await
            .map_err(map_store_error)
    }

    async fn list_interfaces(&self, server_id: i64) -> AppResult<Vec<InterfaceRecord>> {
        self.store
            .list_interfaces(server_id)
            .await
            .map_err(map_store_error)
    }

    async fn insert_account(&self, account: &NewAccount) -> AppResult<i64> {
        self.store
            .insert_account(account)
            .await
            .map_err(map_store_error)
    }

    async fn get_account(&self, id: i64) -> AppResult<Option<AccountRecord>> {
        self.store.get_account(id).await.map_err(map_store_error)
    }

    async fn list_accounts(&self) -> AppResult<Vec<AccountRecord>> {
        self.store.list_accounts().await.map_err(map_store_error)
    }

    async fn list_dirty_accounts(&self) -> AppResult<Vec<AccountRecord>> {
        self.store
            .list_dirty_accounts()
            .await
            .map_err(map_store_error)
    }

    async fn list_login_accounts_for_server(
        &self,
        server_id: i64,
    ) -> AppResult<Vec<ServerAccount>> {
        self.store
            .list_login_accounts_for_server(server_id)
            .await
            .map_err(map_store_error)
    }

    async fn set_account_desired(
        &self,
        id: i64,
        is_login_able: bool,
        is_sudo: bool,
    ) -> AppResult<()> {
        self.store
            .set_account_desired(id, is_login_able, is_sudo)
            .await
            .map_err(map_store_error)
    }

    async fn mark_account_updating(&self, id: i64) -> AppResult<bool> {
        self.store
            .mark_account_updating(id)
            .await
            .map_err(map_store_error)
    }

    async fn finish_account(&self, id: i64, success: bool) -> AppResult<bool> {
        self.store
            .finish_account(id, success)
            .await
            .map_err(map_store_error)
    }

    async fn advance_last_login(&self, id: i64, at: OffsetDateTime) -> AppResult<bool> {
        self.store
            .advance_last_login(id, at)
            .await
            .map_err(map_store_error)
    }

    async fn reset_updating_accounts(&self) -> AppResult<u64> {
        self.store
            .reset_updating_accounts()
            .await
            .map_err(map_store_error)
    }

    async fn load_sync_target(&self, account_id: i64) -> AppResult<Option<SyncTarget>> {
        self.store
            .load_sync_target(account_id)
            .await
            .map_err(map_store_error)
    }
}
