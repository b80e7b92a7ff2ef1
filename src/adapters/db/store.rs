// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, time::Duration};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::app::types::{
    AccountRecord, AccountStatus, InterfaceRecord, NewAccount, NewServer, NewUser, NicProbe,
    ServerAccount, ServerRecord, ServerStatus, SyncTarget, UserRecord, UserStatus,
};

#[derive(Debug, Error)]
pub enum FleetStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("timestamp format error: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("empty host")]
    EmptyHost,
    #[error("empty username")]
    EmptyUsername,
    #[error("empty account name")]
    EmptyAccountName,
    #[error("server cannot proxy through itself")]
    SelfProxy,
}

pub type Result<T> = std::result::Result<T, FleetStoreError>;

/// Async store over the schema shared with the web layer. The engine only
/// writes status fields, collected facts, and the account rows its fleet
/// policies create; everything else is the web layer's to mutate.
#[derive(Clone)]
pub struct FleetStore {
    pool: SqlitePool,
}

impl FleetStore {
    /// Open (or create) a file-backed SQLite DB.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let url = format!("sqlite://{}", path.as_ref().to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store (handy for tests).
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        // Improve concurrency for file DBs.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              username TEXT NOT NULL,
              account_name TEXT NOT NULL,
              is_admin INTEGER NOT NULL DEFAULT 0,
              public_key TEXT NOT NULL DEFAULT '',
              status TEXT NOT NULL DEFAULT 'verifying',
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_account_name
              ON users(account_name);

            CREATE TABLE IF NOT EXISTS servers (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              host TEXT NOT NULL,
              port INTEGER NOT NULL DEFAULT 22,
              is_gateway INTEGER NOT NULL DEFAULT 0,
              proxy_server_id INTEGER REFERENCES servers(id),
              server_status TEXT NOT NULL DEFAULT 'unknown',
              kernel_version TEXT NOT NULL DEFAULT '',
              os_version TEXT NOT NULL DEFAULT '',
              is_mounted_home INTEGER NOT NULL DEFAULT 0,
              ipmi TEXT NOT NULL DEFAULT '',
              last_collected_at TEXT,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_servers_host_port
              ON servers(host, port);

            CREATE TABLE IF NOT EXISTS accounts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id INTEGER NOT NULL REFERENCES users(id),
              server_id INTEGER NOT NULL REFERENCES servers(id),
              is_sudo INTEGER NOT NULL DEFAULT 0,
              is_login_able INTEGER NOT NULL DEFAULT 0,
              status TEXT NOT NULL DEFAULT 'dirty',
              last_login_date TEXT,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_user_server
              ON accounts(user_id, server_id);
            CREATE INDEX IF NOT EXISTS idx_accounts_status ON accounts(status);

            CREATE TABLE IF NOT EXISTS server_interfaces (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              server_id INTEGER NOT NULL REFERENCES servers(id),
              pci_address TEXT NOT NULL,
              interface TEXT,
              manufacturer TEXT NOT NULL DEFAULT '',
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_interfaces_server_pci
              ON server_interfaces(server_id, pci_address);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- users ----

    pub async fn insert_user(&self, user: &NewUser) -> Result<i64> {
        if user.username.trim().is_empty() {
            return Err(FleetStoreError::EmptyUsername);
        }
        if user.account_name.trim().is_empty() {
            return Err(FleetStoreError::EmptyAccountName);
        }
        let rec = sqlx::query(
            r#"
            INSERT INTO users(username, account_name, is_admin, public_key, status)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&user.username)
        .bind(&user.account_name)
        .bind(user.is_admin)
        .bind(&user.public_key)
        .bind(user.status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(rec.try_get::<i64, _>("id")?)
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_user).transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_user).collect()
    }

    pub async fn count_users(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    pub async fn set_user_status(&self, id: i64, status: UserStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET status = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replacing the key set invalidates every account of the user.
    pub async fn set_user_public_key(&self, id: i64, public_key: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET public_key = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = ?
            "#,
        )
        .bind(public_key)
        .bind(id)
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            UPDATE accounts
            SET status = 'dirty', updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE user_id = ?
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- servers ----

    /// Insert or update by (host, port).
    pub async fn upsert_server(&self, server: &NewServer) -> Result<i64> {
        if server.host.trim().is_empty() {
            return Err(FleetStoreError::EmptyHost);
        }
        let existing = sqlx::query("SELECT id FROM servers WHERE host = ? AND port = ?")
            .bind(&server.host)
            .bind(server.port as i64)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = existing {
            let id = row.try_get::<i64, _>("id")?;
            if server.proxy_server_id == Some(id) {
                return Err(FleetStoreError::SelfProxy);
            }
            sqlx::query(
                r#"
                UPDATE servers
                SET is_gateway = ?, proxy_server_id = ?, ipmi = ?,
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
                WHERE id = ?
                "#,
            )
            .bind(server.is_gateway)
            .bind(server.proxy_server_id)
            .bind(&server.ipmi)
            .bind(id)
            .execute(&self.pool)
            .await?;
            return Ok(id);
        }
        let rec = sqlx::query(
            r#"
            INSERT INTO servers(host, port, is_gateway, proxy_server_id, ipmi)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&server.host)
        .bind(server.port as i64)
        .bind(server.is_gateway)
        .bind(server.proxy_server_id)
        .bind(&server.ipmi)
        .fetch_one(&self.pool)
        .await?;
        Ok(rec.try_get::<i64, _>("id")?)
    }

    pub async fn get_server(&self, id: i64) -> Result<Option<ServerRecord>> {
        let row = sqlx::query("SELECT * FROM servers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_server).transpose()
    }

    pub async fn list_servers(&self) -> Result<Vec<ServerRecord>> {
        let rows = sqlx::query("SELECT * FROM servers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_server).collect()
    }

    pub async fn set_server_status(&self, id: i64, status: ServerStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE servers
            SET server_status = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_server_facts(&self, id: i64, kernel: &str, os: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE servers
            SET kernel_version = ?, os_version = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = ?
            "#,
        )
        .bind(kernel)
        .bind(os)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_server_collected(&self, id: i64, at: OffsetDateTime) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE servers
            SET last_collected_at = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = ?
            "#,
        )
        .bind(at.format(&Rfc3339)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or update by (server, pci_address); rows are never deleted here.
    pub async fn upsert_interface(&self, server_id: i64, probe: &NicProbe) -> Result<i64> {
        let rec = sqlx::query(
            r#"
            INSERT INTO server_interfaces(server_id, pci_address, interface, manufacturer)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(server_id, pci_address) DO UPDATE
            SET interface = excluded.interface,
                manufacturer = excluded.manufacturer,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            RETURNING id
            "#,
        )
        .bind(server_id)
        .bind(&probe.pci_address)
        .bind(&probe.interface)
        .bind(&probe.description)
        .fetch_one(&self.pool)
        .await?;
        Ok(rec.try_get::<i64, _>("id")?)
    }

    pub async fn list_interfaces(&self, server_id: i64) -> Result<Vec<InterfaceRecord>> {
        let rows = sqlx::query("SELECT * FROM server_interfaces WHERE server_id = ? ORDER BY id")
            .bind(server_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_interface).collect()
    }

    // ---- accounts ----

    /// New accounts start DIRTY; the login stamp starts at insert time so the
    /// idle policy counts from provisioning, not from epoch.
    pub async fn insert_account(&self, account: &NewAccount) -> Result<i64> {
        let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
        let rec = sqlx::query(
            r#"
            INSERT INTO accounts(user_id, server_id, is_sudo, is_login_able, status, last_login_date)
            VALUES (?, ?, ?, ?, 'dirty', ?)
            RETURNING id
            "#,
        )
        .bind(account.user_id)
        .bind(account.server_id)
        .bind(account.is_sudo)
        .bind(account.is_login_able)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(rec.try_get::<i64, _>("id")?)
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<AccountRecord>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_account).transpose()
    }

    pub async fn list_accounts(&self) -> Result<Vec<AccountRecord>> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_account).collect()
    }

    pub async fn list_dirty_accounts(&self) -> Result<Vec<AccountRecord>> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE status = 'dirty' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_account).collect()
    }

    pub async fn list_login_accounts_for_server(
        &self,
        server_id: i64,
    ) -> Result<Vec<ServerAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id AS account_id, u.account_name AS account_name
            FROM accounts a
            JOIN users u ON u.id = a.user_id
            WHERE a.server_id = ? AND a.is_login_able = 1
            ORDER BY a.id
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(ServerAccount {
                    account_id: row.try_get("account_id")?,
                    account_name: row.try_get("account_name")?,
                })
            })
            .collect()
    }

    pub async fn set_account_desired(
        &self,
        id: i64,
        is_login_able: bool,
        is_sudo: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET is_login_able = ?, is_sudo = ?, status = 'dirty',
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = ?
            "#,
        )
        .bind(is_login_able)
        .bind(is_sudo)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// DIRTY -> UPDATING, applied only if the row is still DIRTY.
    pub async fn mark_account_updating(&self, id: i64) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE accounts
            SET status = 'updating', updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = ? AND status = 'dirty'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Terminal transition of a convergence attempt, guarded on the row
    /// still being UPDATING so a raced DIRTY re-mark is never clobbered.
    pub async fn finish_account(&self, id: i64, success: bool) -> Result<bool> {
        let status = if success { "active" } else { "dirty" };
        let done = sqlx::query(
            r#"
            UPDATE accounts
            SET status = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = ? AND status = 'updating'
            "#,
        )
        .bind(status)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Monotonic advance: the stored stamp moves only if `at` is strictly
    /// newer. An unparseable stored value is treated as absent.
    pub async fn advance_last_login(&self, id: i64, at: OffsetDateTime) -> Result<bool> {
        let row = sqlx::query("SELECT last_login_date FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let stored: Option<String> = row.try_get("last_login_date")?;
        let stored_at = stored
            .as_deref()
            .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok());
        if let Some(stored_at) = stored_at {
            if at <= stored_at {
                return Ok(false);
            }
        }
        sqlx::query(
            r#"
            UPDATE accounts
            SET last_login_date = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = ?
            "#,
        )
        .bind(at.format(&Rfc3339)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    /// Startup recovery: accounts stuck UPDATING from a previous run.
    pub async fn reset_updating_accounts(&self) -> Result<u64> {
        let done = sqlx::query(
            r#"
            UPDATE accounts
            SET status = 'dirty', updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE status = 'updating'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    pub async fn load_sync_target(&self, account_id: i64) -> Result<Option<SyncTarget>> {
        let Some(account) = self.get_account(account_id).await? else {
            return Ok(None);
        };
        let Some(server) = self.get_server(account.server_id).await? else {
            return Ok(None);
        };
        let Some(user) = self.get_user(account.user_id).await? else {
            return Ok(None);
        };
        let proxy = match server.proxy_server_id {
            Some(proxy_id) => self.get_server(proxy_id).await?,
            None => None,
        };
        Ok(Some(SyncTarget {
            account,
            server,
            proxy,
            user,
        }))
    }
}

fn row_to_user(row: sqlx::sqlite::SqliteRow) -> Result<UserRecord> {
    let status: String = row.try_get("status")?;
    Ok(UserRecord {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        account_name: row.try_get("account_name")?,
        is_admin: row.try_get("is_admin")?,
        public_key: row.try_get("public_key")?,
        status: UserStatus::parse(&status),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_server(row: sqlx::sqlite::SqliteRow) -> Result<ServerRecord> {
    let status: String = row.try_get("server_status")?;
    let port: i64 = row.try_get("port")?;
    Ok(ServerRecord {
        id: row.try_get("id")?,
        host: row.try_get("host")?,
        port: port as u16,
        is_gateway: row.try_get("is_gateway")?,
        proxy_server_id: row.try_get("proxy_server_id")?,
        server_status: ServerStatus::parse(&status),
        kernel_version: row.try_get("kernel_version")?,
        os_version: row.try_get("os_version")?,
        is_mounted_home: row.try_get("is_mounted_home")?,
        ipmi: row.try_get("ipmi")?,
        last_collected_at: row.try_get("last_collected_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_account(row: sqlx::sqlite::SqliteRow) -> Result<AccountRecord> {
    let status: String = row.try_get("status")?;
    Ok(AccountRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        server_id: row.try_get("server_id")?,
        is_sudo: row.try_get("is_sudo")?,
        is_login_able: row.try_get("is_login_able")?,
        status: AccountStatus::parse(&status),
        last_login_date: row.try_get("last_login_date")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_interface(row: sqlx::sqlite::SqliteRow) -> Result<InterfaceRecord> {
    Ok(InterfaceRecord {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        pci_address: row.try_get("pci_address")?,
        interface: row.try_get("interface")?,
        manufacturer: row.try_get("manufacturer")?,
    })
}
