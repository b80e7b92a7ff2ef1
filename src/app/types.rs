// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use serde::{Deserialize, Serialize};

/// Reachability / health of a managed server, as observed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Active,
    Unreachable,
    BadKey,
    NoPermission,
    SshError,
    Unknown,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Active => "active",
            ServerStatus::Unreachable => "unreachable",
            ServerStatus::BadKey => "bad_key",
            ServerStatus::NoPermission => "no_permission",
            ServerStatus::SshError => "ssh_error",
            ServerStatus::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "active" => ServerStatus::Active,
            "unreachable" => ServerStatus::Unreachable,
            "bad_key" => ServerStatus::BadKey,
            "no_permission" => ServerStatus::NoPermission,
            "ssh_error" => ServerStatus::SshError,
            _ => ServerStatus::Unknown,
        }
    }
}

/// Lifecycle of a managed person. GRADUATED is terminal for login purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Verifying,
    Active,
    Graduated,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Verifying => "verifying",
            UserStatus::Active => "active",
            UserStatus::Graduated => "graduated",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "active" => UserStatus::Active,
            "graduated" => UserStatus::Graduated,
            _ => UserStatus::Verifying,
        }
    }
}

/// Reconciliation state of one (user, server) account row.
///
/// Legal transitions: DIRTY -> UPDATING -> {ACTIVE, DIRTY}. UPDATING is only
/// entered by the watcher's scan; ACTIVE only by a successful convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Dirty,
    Updating,
    Active,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Dirty => "dirty",
            AccountStatus::Updating => "updating",
            AccountStatus::Active => "active",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "updating" => AccountStatus::Updating,
            "active" => AccountStatus::Active,
            _ => AccountStatus::Dirty,
        }
    }
}

/// PCI device class the inventory probe filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicKind {
    Ethernet,
    Infiniband,
}

impl NicKind {
    pub fn pci_filter(self) -> &'static str {
        match self {
            NicKind::Ethernet => "ethernet",
            NicKind::Infiniband => "infiniband",
        }
    }
}

/// Payload for creating or upserting a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewServer {
    pub host: String,
    pub port: u16,
    pub is_gateway: bool,
    /// At most one proxy hop. A server must not proxy through itself.
    pub proxy_server_id: Option<i64>,
    pub ipmi: String,
}

/// Full stored server row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub is_gateway: bool,
    pub proxy_server_id: Option<i64>,
    pub server_status: ServerStatus,
    pub kernel_version: String,
    pub os_version: String,
    pub is_mounted_home: bool,
    pub ipmi: String,
    /// RFC 3339; absent until the first successful inventory collection.
    pub last_collected_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    /// OS-level login name provisioned on remote hosts.
    pub account_name: String,
    pub is_admin: bool,
    /// One or more SSH public keys, newline-separated.
    pub public_key: String,
    pub status: UserStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub account_name: String,
    pub is_admin: bool,
    pub public_key: String,
    pub status: UserStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub user_id: i64,
    pub server_id: i64,
    pub is_sudo: bool,
    pub is_login_able: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: i64,
    pub user_id: i64,
    pub server_id: i64,
    pub is_sudo: bool,
    pub is_login_able: bool,
    pub status: AccountStatus,
    /// RFC 3339; advanced monotonically from collected login facts.
    pub last_login_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A NIC discovered on a server, keyed by (server, pci_address).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub id: i64,
    pub server_id: i64,
    pub pci_address: String,
    /// Interface name when `/sys/class/net` resolves to this PCI device.
    pub interface: Option<String>,
    pub manufacturer: String,
}

/// One probed PCI NIC, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicProbe {
    pub pci_address: String,
    pub description: String,
    pub interface: Option<String>,
}

/// A login-enabled account on a server, as the collector needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAccount {
    pub account_id: i64,
    pub account_name: String,
}

/// Eager, by-value snapshot handed to a convergence task. Detached from the
/// store: nothing here lazily re-touches the database from another task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub account: AccountRecord,
    pub server: ServerRecord,
    pub proxy: Option<ServerRecord>,
    pub user: UserRecord,
}

/// Daemon-wide SSH identity used for all outbound sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub username: String,
    pub identity_path: Option<String>,
}

/// One proxy hop on the way to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshHop {
    pub host: String,
    pub port: u16,
}

/// Fully resolved connection target for the remote executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub identity_path: Option<String>,
    pub proxy: Option<SshHop>,
}

impl SshTarget {
    pub fn for_server(
        server: &ServerRecord,
        proxy: Option<&ServerRecord>,
        ssh: &SshSettings,
    ) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            username: ssh.username.clone(),
            identity_path: ssh.identity_path.clone(),
            proxy: proxy.map(|p| SshHop {
                host: p.host.clone(),
                port: p.port,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The web layer reads these rows as JSON; the lowercase wire form is a
    // contract shared with it, not an implementation detail.
    #[test]
    fn statuses_serialize_to_their_stored_lowercase_form() {
        assert_eq!(
            serde_json::to_value(ServerStatus::BadKey).unwrap(),
            "bad_key"
        );
        assert_eq!(
            serde_json::to_value(UserStatus::Graduated).unwrap(),
            "graduated"
        );
        assert_eq!(
            serde_json::to_value(AccountStatus::Updating).unwrap(),
            "updating"
        );
        for status in [
            ServerStatus::Active,
            ServerStatus::Unreachable,
            ServerStatus::BadKey,
            ServerStatus::NoPermission,
            ServerStatus::SshError,
            ServerStatus::Unknown,
        ] {
            assert_eq!(serde_json::to_value(status).unwrap(), status.as_str());
        }
    }

    #[test]
    fn account_record_serializes_with_its_status_inline() {
        let record = AccountRecord {
            id: 1,
            user_id: 2,
            server_id: 7,
            is_sudo: false,
            is_login_able: true,
            status: AccountStatus::Dirty,
            last_login_date: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "dirty");
        assert_eq!(json["last_login_date"], serde_json::Value::Null);
        assert_eq!(json["is_login_able"], true);
    }
}
