// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! The control loop. Every tick runs five store-only policies and launches
//! remote work as independently supervised tasks; the loop itself never
//! blocks on remote I/O.
//!
//! Two coordination mechanisms guard the loop's concurrency:
//! - a counting semaphore bounds how many reconciler + collector tasks hold
//!   an open session at once, and
//! - per-entity in-flight registries stop two ticks from double-dispatching
//!   the same account or server. Entries are cleared by a drop guard, so
//!   every task exit path releases its claim.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{watch, Semaphore};

use crate::app::collector;
use crate::app::errors::AppResult;
use crate::app::ports::{ClockPort, FleetStorePort, RemoteExecPort};
use crate::app::reconciler;
use crate::app::types::{NewAccount, ServerRecord, SshSettings, UserRecord, UserStatus};

/// Fixed scheduling policy of the loop.
#[derive(Debug, Clone)]
pub struct Policy {
    pub tick_interval: Duration,
    pub drain_poll: Duration,
    /// Concurrent remote-session budget shared by reconciler and collector
    /// tasks.
    pub max_sessions: usize,
    /// Login-enabled accounts idle longer than this are disabled, unless the
    /// server is a gateway or the user is an admin.
    pub idle_revocation: time::Duration,
    /// Servers whose last successful collection is older than this are
    /// re-collected.
    pub inventory_max_age: time::Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            drain_poll: Duration::from_secs(1),
            max_sessions: 20,
            idle_revocation: time::Duration::days(30),
            inventory_max_age: time::Duration::hours(1),
        }
    }
}

type Registry = Arc<Mutex<HashSet<i64>>>;

/// Claim on one entity in an in-flight registry; dropped on every task exit
/// path, releasing the entity for the next tick.
struct InFlightGuard {
    registry: Registry,
    id: i64,
}

impl InFlightGuard {
    fn try_claim(registry: &Registry, id: i64) -> Option<Self> {
        let mut ids = registry.lock().unwrap_or_else(|e| e.into_inner());
        if !ids.insert(id) {
            return None;
        }
        Some(Self {
            registry: Arc::clone(registry),
            id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

pub struct Watcher {
    remote: Arc<dyn RemoteExecPort>,
    store: Arc<dyn FleetStorePort>,
    clock: Arc<dyn ClockPort>,
    ssh: SshSettings,
    policy: Policy,
    permits: Arc<Semaphore>,
    accounts_in_flight: Registry,
    servers_in_flight: Registry,
}

impl Watcher {
    pub fn new(
        remote: Arc<dyn RemoteExecPort>,
        store: Arc<dyn FleetStorePort>,
        clock: Arc<dyn ClockPort>,
        ssh: SshSettings,
        policy: Policy,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(policy.max_sessions));
        Self {
            remote,
            store,
            clock,
            ssh,
            policy,
            permits,
            accounts_in_flight: Arc::new(Mutex::new(HashSet::new())),
            servers_in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Tick until the stop signal flips, then drain in-flight tasks.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        tracing::info!(
            tick_interval_secs = self.policy.tick_interval.as_secs(),
            max_sessions = self.policy.max_sessions,
            "watcher started"
        );
        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(self.policy.tick_interval) => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }
        }
        self.drain().await;
        tracing::info!("watcher stopped");
    }

    /// One scheduling pass. A failing policy is logged and must not stop the
    /// remaining policies or the loop.
    pub async fn tick(self: &Arc<Self>) {
        if let Err(err) = self.dispatch_dirty_accounts().await {
            tracing::warn!(error = %err, "convergence dispatch failed");
        }
        if let Err(err) = self.ensure_gateway_accounts().await {
            tracing::warn!(error = %err, "gateway provisioning failed");
        }
        if let Err(err) = self.disable_departed_accounts().await {
            tracing::warn!(error = %err, "departed-user cleanup failed");
        }
        if let Err(err) = self.revoke_idle_accounts().await {
            tracing::warn!(error = %err, "idle-account revocation failed");
        }
        if let Err(err) = self.dispatch_inventory().await {
            tracing::warn!(error = %err, "inventory dispatch failed");
        }
    }

    /// Wait until every launched task has released its in-flight claim.
    pub async fn drain(&self) {
        loop {
            let pending = {
                let accounts = self
                    .accounts_in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                let servers = self
                    .servers_in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                accounts.len() + servers.len()
            };
            if pending == 0 {
                return;
            }
            tracing::info!(pending, "waiting for in-flight tasks");
            tokio::time::sleep(self.policy.drain_poll).await;
        }
    }

    /// Policy 1: every DIRTY account not already in flight goes UPDATING and
    /// gets a convergence task.
    async fn dispatch_dirty_accounts(self: &Arc<Self>) -> AppResult<()> {
        for account in self.store.list_dirty_accounts().await? {
            let Some(guard) = InFlightGuard::try_claim(&self.accounts_in_flight, account.id)
            else {
                continue;
            };
            if !self.store.mark_account_updating(account.id).await? {
                continue;
            }
            let Some(target) = self.store.load_sync_target(account.id).await? else {
                tracing::warn!(account_id = account.id, "account lost its user or server");
                self.store.finish_account(account.id, false).await?;
                continue;
            };
            let watcher = Arc::clone(self);
            tokio::spawn(async move {
                let _guard = guard;
                let Ok(_permit) = Arc::clone(&watcher.permits).acquire_owned().await else {
                    return;
                };
                let result = reconciler::sync_account(
                    watcher.remote.as_ref(),
                    watcher.store.as_ref(),
                    &watcher.ssh,
                    &target,
                )
                .await;
                if let Err(err) = result {
                    tracing::error!(
                        account_id = target.account.id,
                        error = %err,
                        "account status write-back failed"
                    );
                }
            });
        }
        Ok(())
    }

    /// Policy 2: every gateway server carries a login-enabled account for
    /// every ACTIVE user; admins get sudo.
    async fn ensure_gateway_accounts(&self) -> AppResult<()> {
        let servers = self.store.list_servers().await?;
        if !servers.iter().any(|s| s.is_gateway) {
            return Ok(());
        }
        let users = self.store.list_users().await?;
        let accounts = self.store.list_accounts().await?;
        for server in servers.iter().filter(|s| s.is_gateway) {
            for user in users.iter().filter(|u| u.status == UserStatus::Active) {
                let wanted_sudo = user.is_admin;
                let existing = accounts
                    .iter()
                    .find(|a| a.user_id == user.id && a.server_id == server.id);
                match existing {
                    None => {
                        self.store
                            .insert_account(&NewAccount {
                                user_id: user.id,
                                server_id: server.id,
                                is_sudo: wanted_sudo,
                                is_login_able: true,
                            })
                            .await?;
                        tracing::info!(
                            account = %user.account_name,
                            host = %server.host,
                            "provisioning gateway account"
                        );
                    }
                    Some(account)
                        if !account.is_login_able || account.is_sudo != wanted_sudo =>
                    {
                        self.store
                            .set_account_desired(account.id, true, wanted_sudo)
                            .await?;
                        tracing::info!(
                            account = %user.account_name,
                            host = %server.host,
                            "correcting gateway account"
                        );
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Policy 3: accounts of GRADUATED users lose login.
    async fn disable_departed_accounts(&self) -> AppResult<()> {
        let users = by_id(self.store.list_users().await?, |u: &UserRecord| u.id);
        for account in self.store.list_accounts().await? {
            if !account.is_login_able {
                continue;
            }
            let Some(user) = users.get(&account.user_id) else {
                continue;
            };
            if user.status != UserStatus::Graduated {
                continue;
            }
            self.store
                .set_account_desired(account.id, false, account.is_sudo)
                .await?;
            tracing::info!(
                account = %user.account_name,
                account_id = account.id,
                "disabling departed user's account"
            );
        }
        Ok(())
    }

    /// Policy 4: long-idle accounts lose login. Gateways and admins are
    /// exempt.
    async fn revoke_idle_accounts(&self) -> AppResult<()> {
        let now = self.clock.now_utc();
        let users = by_id(self.store.list_users().await?, |u: &UserRecord| u.id);
        let servers = by_id(self.store.list_servers().await?, |s: &ServerRecord| s.id);
        for account in self.store.list_accounts().await? {
            if !account.is_login_able {
                continue;
            }
            if servers.get(&account.server_id).is_some_and(|s| s.is_gateway) {
                continue;
            }
            if users.get(&account.user_id).is_some_and(|u| u.is_admin) {
                continue;
            }
            let Some(raw) = &account.last_login_date else {
                continue;
            };
            let Ok(at) = OffsetDateTime::parse(raw, &Rfc3339) else {
                continue;
            };
            if now - at <= self.policy.idle_revocation {
                continue;
            }
            self.store
                .set_account_desired(account.id, false, account.is_sudo)
                .await?;
            tracing::info!(
                account_id = account.id,
                last_login = %raw,
                "disabling idle account"
            );
        }
        Ok(())
    }

    /// Policy 5: servers with a missing or stale collection get a collector
    /// task.
    async fn dispatch_inventory(self: &Arc<Self>) -> AppResult<()> {
        let now = self.clock.now_utc();
        let servers = self.store.list_servers().await?;
        for server in &servers {
            let stale = match &server.last_collected_at {
                None => true,
                Some(raw) => OffsetDateTime::parse(raw, &Rfc3339)
                    .map(|at| now - at > self.policy.inventory_max_age)
                    .unwrap_or(true),
            };
            if !stale {
                continue;
            }
            let Some(guard) = InFlightGuard::try_claim(&self.servers_in_flight, server.id)
            else {
                continue;
            };
            let proxy = server
                .proxy_server_id
                .and_then(|id| servers.iter().find(|s| s.id == id).cloned());
            let server = server.clone();
            let watcher = Arc::clone(self);
            tokio::spawn(async move {
                let _guard = guard;
                let Ok(_permit) = Arc::clone(&watcher.permits).acquire_owned().await else {
                    return;
                };
                let result = collector::collect_server(
                    watcher.remote.as_ref(),
                    watcher.store.as_ref(),
                    watcher.clock.as_ref(),
                    &watcher.ssh,
                    &server,
                    proxy.as_ref(),
                )
                .await;
                if let Err(err) = result {
                    tracing::error!(
                        server_id = server.id,
                        error = %err,
                        "server status write-back failed"
                    );
                }
            });
        }
        Ok(())
    }
}

fn by_id<T, F: Fn(&T) -> i64>(items: Vec<T>, id: F) -> HashMap<i64, T> {
    items.into_iter().map(|item| (id(&item), item)).collect()
}
