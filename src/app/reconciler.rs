// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Convergence of one account on one server.
//!
//! The attempt works from a detached [`SyncTarget`] snapshot and never
//! re-reads the store mid-flight. The outcome is binary: either every step
//! completed or the first failure aborts the rest, and the status write-back
//! goes through the store's conditional transition so a DIRTY re-mark that
//! raced the attempt survives.

use crate::app::commands::account;
use crate::app::errors::{AppError, AppResult};
use crate::app::ports::{FleetStorePort, RemoteExecPort, RemoteSessionPort};
use crate::app::types::{ServerStatus, SshSettings, SshTarget, SyncTarget};

/// Run one convergence attempt and report the terminal status back to the
/// store. Errors from the write-back itself are returned; convergence errors
/// are logged and absorbed into the failure status.
pub async fn sync_account(
    remote: &dyn RemoteExecPort,
    store: &dyn FleetStorePort,
    ssh: &SshSettings,
    target: &SyncTarget,
) -> AppResult<()> {
    let outcome = converge(remote, ssh, target).await;
    let success = match &outcome {
        Ok(()) => {
            tracing::info!(
                account = %target.user.account_name,
                host = %target.server.host,
                "account converged"
            );
            true
        }
        Err(err) => {
            tracing::warn!(
                account = %target.user.account_name,
                host = %target.server.host,
                error = %err,
                "account convergence failed"
            );
            if err.is_unreachable() {
                store
                    .set_server_status(target.server.id, ServerStatus::Unreachable)
                    .await?;
            }
            false
        }
    };
    let applied = store.finish_account(target.account.id, success).await?;
    if !applied {
        tracing::info!(
            account = %target.user.account_name,
            host = %target.server.host,
            "account re-marked dirty during convergence, keeping it dirty"
        );
    }
    Ok(())
}

/// The convergence attempt itself. Steps are strictly ordered and each
/// failure is fatal to the remaining steps.
pub async fn converge(
    remote: &dyn RemoteExecPort,
    ssh: &SshSettings,
    target: &SyncTarget,
) -> AppResult<()> {
    let ssh_target = SshTarget::for_server(&target.server, target.proxy.as_ref(), ssh);
    let session = remote.connect(&ssh_target).await?;
    let result = converge_over(session.as_ref(), target).await;
    session.close().await;
    result.map_err(|err| {
        err.with_context(format!(
            "account {} on {}",
            target.user.account_name, target.server.host
        ))
    })
}

async fn converge_over(
    session: &dyn RemoteSessionPort,
    target: &SyncTarget,
) -> Result<(), AppError> {
    let name = &target.user.account_name;
    if !account::exists(session, name).await? {
        account::create(session, name).await?;
    }
    if !target.account.is_login_able {
        // Sudo state is moot while login is disabled; leave it alone.
        return account::disable(session, name).await;
    }
    let existing = account::read_authorized_keys(session, name).await?;
    let merged = merge_authorized_keys(&existing, &target.user.public_key);
    account::enable(session, name, &merged).await?;
    account::set_sudo(session, name, target.account.is_sudo).await?;
    Ok(())
}

/// Union of remote and desired key sets: existing entries first in their
/// remote order, then desired keys not already present in their given order.
/// Blank lines are dropped, duplicates kept once.
pub fn merge_authorized_keys(existing: &str, desired: &str) -> String {
    let mut merged: Vec<&str> = Vec::new();
    for line in existing.lines().chain(desired.lines()) {
        let line = line.trim();
        if line.is_empty() || merged.contains(&line) {
            continue;
        }
        merged.push(line);
    }
    merged.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::errors::{codes, AppErrorKind};
    use crate::app::testing::{out, ScriptedRemote, ScriptedSession};
    use crate::app::types::{
        AccountRecord, AccountStatus, ServerRecord, ServerStatus, UserRecord, UserStatus,
    };

    fn server(host: &str) -> ServerRecord {
        ServerRecord {
            id: 7,
            host: host.to_string(),
            port: 22,
            is_gateway: false,
            proxy_server_id: None,
            server_status: ServerStatus::Active,
            kernel_version: String::new(),
            os_version: String::new(),
            is_mounted_home: false,
            ipmi: String::new(),
            last_collected_at: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn target(is_login_able: bool, is_sudo: bool, public_key: &str) -> SyncTarget {
        SyncTarget {
            account: AccountRecord {
                id: 1,
                user_id: 2,
                server_id: 7,
                is_sudo,
                is_login_able,
                status: AccountStatus::Updating,
                last_login_date: None,
                created_at: "2026-01-01T00:00:00Z".to_string(),
                updated_at: "2026-01-01T00:00:00Z".to_string(),
            },
            server: server("node1"),
            proxy: None,
            user: UserRecord {
                id: 2,
                username: "Alice L".to_string(),
                account_name: "alice".to_string(),
                is_admin: false,
                public_key: public_key.to_string(),
                status: UserStatus::Active,
                created_at: "2026-01-01T00:00:00Z".to_string(),
                updated_at: "2026-01-01T00:00:00Z".to_string(),
            },
        }
    }

    fn ssh() -> SshSettings {
        SshSettings {
            username: "fleet".to_string(),
            identity_path: None,
        }
    }

    #[test]
    fn merge_keeps_existing_order_then_appends_new() {
        let merged = merge_authorized_keys(
            "ssh-rsa OLD root@node\nssh-ed25519 AAA alice@a\n",
            "ssh-ed25519 BBB alice@b\nssh-ed25519 AAA alice@a",
        );
        assert_eq!(
            merged,
            "ssh-rsa OLD root@node\nssh-ed25519 AAA alice@a\nssh-ed25519 BBB alice@b"
        );
    }

    #[test]
    fn merge_drops_blank_lines_and_duplicates() {
        let merged = merge_authorized_keys("\nssh-ed25519 AAA a\n\n", "ssh-ed25519 AAA a\n\n");
        assert_eq!(merged, "ssh-ed25519 AAA a");
    }

    #[test]
    fn merge_of_empty_remote_is_the_desired_set() {
        let merged = merge_authorized_keys("", "ssh-ed25519 AAA a\nssh-ed25519 BBB b");
        assert_eq!(merged, "ssh-ed25519 AAA a\nssh-ed25519 BBB b");
    }

    #[tokio::test]
    async fn login_disabled_stops_before_touching_sudo() {
        let remote = ScriptedRemote::new().expect_connect(
            "node1",
            Ok(ScriptedSession::new(vec![
                ("getent passwd alice", Ok(out(0, "alice:x:1000:", ""))),
                (
                    "sudo cat /home/alice/.ssh/authorized_keys",
                    Ok(out(0, "ssh-ed25519 AAA a", "")),
                ),
                (
                    "sudo mv /home/alice/.ssh/authorized_keys /home/alice/.ssh/authorized_keys.n2sysbackup",
                    Ok(out(0, "", "")),
                ),
            ])),
        );
        converge(&remote, &ssh(), &target(false, true, "ssh-ed25519 AAA a"))
            .await
            .unwrap();
        remote.assert_done();
    }

    #[tokio::test]
    async fn missing_account_is_created_then_enabled() {
        let remote = ScriptedRemote::new().expect_connect(
            "node1",
            Ok(ScriptedSession::new(vec![
                ("getent passwd alice", Ok(out(2, "", ""))),
                ("sudo useradd alice -m -d /home/alice", Ok(out(0, "", ""))),
                (
                    "echo \"alice:123456\" | sudo chpasswd --crypt-method=SHA256",
                    Ok(out(0, "", "")),
                ),
                (
                    "sudo cat /home/alice/.ssh/authorized_keys",
                    Ok(out(1, "", "cat: ...: No such file or directory")),
                ),
                (
                    "sudo cat /home/alice/.ssh/authorized_keys.n2sysbackup",
                    Ok(out(1, "", "cat: ...: No such file or directory")),
                ),
                ("sudo mkdir -p /home/alice/.ssh", Ok(out(0, "", ""))),
                (
                    "echo \"ssh-ed25519 AAA a\" | sudo tee /home/alice/.ssh/authorized_keys",
                    Ok(out(0, "ssh-ed25519 AAA a", "")),
                ),
                (
                    "sudo chown alice:alice /home/alice/.ssh/authorized_keys",
                    Ok(out(0, "", "")),
                ),
                (
                    "sudo chmod 600 /home/alice/.ssh/authorized_keys",
                    Ok(out(0, "", "")),
                ),
                (
                    "getent passwd alice",
                    Ok(out(0, "alice:x:1000:1000::/home/alice:/bin/bash", "")),
                ),
                ("getent group sudo", Ok(out(0, "sudo:x:27:", ""))),
            ])),
        );
        converge(&remote, &ssh(), &target(true, false, "ssh-ed25519 AAA a"))
            .await
            .unwrap();
        remote.assert_done();
    }

    #[tokio::test]
    async fn first_failing_step_aborts_and_carries_context() {
        let remote = ScriptedRemote::new().expect_connect(
            "node1",
            Ok(ScriptedSession::new(vec![
                ("getent passwd alice", Ok(out(2, "", ""))),
                (
                    "sudo useradd alice -m -d /home/alice",
                    Ok(out(1, "", "useradd: permission denied")),
                ),
            ])),
        );
        let err = converge(&remote, &ssh(), &target(true, false, "k"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::COMMAND_FAILED);
        assert_eq!(err.context(), Some("account alice on node1"));
        remote.assert_done();
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_is() {
        let remote = ScriptedRemote::new().expect_connect(
            "node1",
            Err(AppError::new(AppErrorKind::Unreachable, codes::UNREACHABLE)),
        );
        let err = converge(&remote, &ssh(), &target(true, false, "k"))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
        remote.assert_done();
    }
}
