// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Idempotent account administration over one remote session.
//!
//! Several failure modes can only be told apart by the remote tool's error
//! text (a missing keys file and a permission problem both exit non-zero), so
//! the helpers here match on stderr where it matters. Observable side effects
//! are part of the engine's contract: the keys file lives at
//! `~/.ssh/authorized_keys`, mode 600, owned by the account; a disabled
//! account keeps its keys under the `.n2sysbackup` name so re-enabling can
//! recover them.

use crate::app::errors::AppResult;
use crate::app::ports::RemoteSessionPort;

use super::{command_failed, COMMAND_TIMEOUT};

pub const BACKUP_SUFFIX: &str = ".n2sysbackup";

const NOLOGIN_SHELLS: &[&str] = &["/usr/sbin/nologin", "/sbin/nologin", "/bin/false"];
const INTERACTIVE_SHELL: &str = "/bin/bash";
const NO_SUCH_FILE: &str = "No such file or directory";

fn keys_path(account: &str) -> String {
    format!("/home/{account}/.ssh/authorized_keys")
}

fn backup_path(account: &str) -> String {
    format!("/home/{account}/.ssh/authorized_keys{BACKUP_SUFFIX}")
}

/// True iff the OS user exists on the remote host.
pub async fn exists(session: &dyn RemoteSessionPort, account: &str) -> AppResult<bool> {
    let out = session
        .run(&format!("getent passwd {account}"), COMMAND_TIMEOUT)
        .await?;
    Ok(out.ok())
}

/// Create the OS user with a home directory and a placeholder password.
/// Only safe to call when `exists` reported false; not internally idempotent.
pub async fn create(session: &dyn RemoteSessionPort, account: &str) -> AppResult<()> {
    let out = session
        .run(
            &format!("sudo useradd {account} -m -d /home/{account}"),
            COMMAND_TIMEOUT,
        )
        .await?;
    if !out.ok() {
        return Err(command_failed("useradd", &out));
    }
    let out = session
        .run(
            &format!("echo \"{account}:123456\" | sudo chpasswd --crypt-method=SHA256"),
            COMMAND_TIMEOUT,
        )
        .await?;
    if !out.ok() {
        return Err(command_failed("chpasswd", &out));
    }
    Ok(())
}

/// Read the live keys file, falling back to the disabled backup copy.
/// A missing file is an expected branch, not an error; if neither file is
/// readable the result is empty.
pub async fn read_authorized_keys(
    session: &dyn RemoteSessionPort,
    account: &str,
) -> AppResult<String> {
    let out = session
        .run(
            &format!("sudo cat {}", keys_path(account)),
            COMMAND_TIMEOUT,
        )
        .await?;
    if out.ok() {
        return Ok(out.stdout_trimmed().to_string());
    }
    if out.stderr_trimmed().contains(NO_SUCH_FILE) {
        let out = session
            .run(
                &format!("sudo cat {}", backup_path(account)),
                COMMAND_TIMEOUT,
            )
            .await?;
        if out.ok() {
            return Ok(out.stdout_trimmed().to_string());
        }
    }
    Ok(String::new())
}

/// Write the full key set and make sure the account can actually log in:
/// `.ssh` exists, the keys file is owned by the account with mode 600, and a
/// no-login shell is swapped for an interactive one.
pub async fn enable(
    session: &dyn RemoteSessionPort,
    account: &str,
    authorized_keys: &str,
) -> AppResult<()> {
    let path = keys_path(account);
    let out = session
        .run(
            &format!("sudo mkdir -p /home/{account}/.ssh"),
            COMMAND_TIMEOUT,
        )
        .await?;
    if !out.ok() {
        return Err(command_failed("mkdir .ssh", &out));
    }
    let out = session
        .run(
            &format!("echo \"{authorized_keys}\" | sudo tee {path}"),
            COMMAND_TIMEOUT,
        )
        .await?;
    if !out.ok() {
        return Err(command_failed("write authorized_keys", &out));
    }
    let out = session
        .run(
            &format!("sudo chown {account}:{account} {path}"),
            COMMAND_TIMEOUT,
        )
        .await?;
    if !out.ok() {
        return Err(command_failed("chown authorized_keys", &out));
    }
    let out = session
        .run(&format!("sudo chmod 600 {path}"), COMMAND_TIMEOUT)
        .await?;
    if !out.ok() {
        return Err(command_failed("chmod authorized_keys", &out));
    }
    let shell = login_shell(session, account).await?;
    if NOLOGIN_SHELLS.contains(&shell.as_str()) {
        let out = session
            .run(
                &format!("sudo usermod -s {INTERACTIVE_SHELL} {account}"),
                COMMAND_TIMEOUT,
            )
            .await?;
        if !out.ok() {
            return Err(command_failed("set login shell", &out));
        }
    }
    Ok(())
}

/// Reversible disable: move the keys file to the backup name. A keys file
/// that is already gone means the account is already disabled.
pub async fn disable(session: &dyn RemoteSessionPort, account: &str) -> AppResult<()> {
    let path = keys_path(account);
    let out = session
        .run(&format!("sudo cat {path}"), COMMAND_TIMEOUT)
        .await?;
    if !out.ok() {
        if out.stderr_trimmed().contains(NO_SUCH_FILE) {
            return Ok(());
        }
        return Err(command_failed("read authorized_keys", &out));
    }
    let out = session
        .run(
            &format!("sudo mv {path} {}", backup_path(account)),
            COMMAND_TIMEOUT,
        )
        .await?;
    if !out.ok() {
        return Err(command_failed("move authorized_keys to backup", &out));
    }
    Ok(())
}

/// True iff the keys file is present and the shell allows logins.
pub async fn is_enabled(session: &dyn RemoteSessionPort, account: &str) -> AppResult<bool> {
    let out = session
        .run(
            &format!("sudo test -f {}", keys_path(account)),
            COMMAND_TIMEOUT,
        )
        .await?;
    if !out.ok() {
        return Ok(false);
    }
    let shell = login_shell(session, account).await?;
    Ok(!NOLOGIN_SHELLS.contains(&shell.as_str()))
}

/// Bring sudo-group membership to the wanted state. Returns whether a remote
/// mutation was actually issued; the already-correct case touches nothing.
pub async fn set_sudo(
    session: &dyn RemoteSessionPort,
    account: &str,
    wanted: bool,
) -> AppResult<bool> {
    let member = sudo_group_member(session, account).await?;
    if member == wanted {
        return Ok(false);
    }
    let out = if wanted {
        session
            .run(&format!("sudo usermod -aG sudo {account}"), COMMAND_TIMEOUT)
            .await?
    } else {
        session
            .run(&format!("sudo gpasswd -d {account} sudo"), COMMAND_TIMEOUT)
            .await?
    };
    if !out.ok() {
        return Err(command_failed(
            if wanted {
                "add to sudo group"
            } else {
                "remove from sudo group"
            },
            &out,
        ));
    }
    Ok(true)
}

async fn sudo_group_member(session: &dyn RemoteSessionPort, account: &str) -> AppResult<bool> {
    let out = session.run("getent group sudo", COMMAND_TIMEOUT).await?;
    if !out.ok() {
        // getent exits 2 when the key is unknown; no sudo group means no
        // members.
        if out.exit_code == 2 {
            return Ok(false);
        }
        return Err(command_failed("read sudo group", &out));
    }
    Ok(group_members(out.stdout_trimmed())
        .iter()
        .any(|member| *member == account))
}

async fn login_shell(session: &dyn RemoteSessionPort, account: &str) -> AppResult<String> {
    let out = session
        .run(&format!("getent passwd {account}"), COMMAND_TIMEOUT)
        .await?;
    if !out.ok() {
        return Err(command_failed("read login shell", &out));
    }
    Ok(out
        .stdout_trimmed()
        .rsplit(':')
        .next()
        .unwrap_or_default()
        .to_string())
}

/// Member names from a `getent group` line. Exact comma-separated names:
/// "al" must not match when only "ally" is listed.
pub fn group_members(line: &str) -> Vec<&str> {
    let Some(members) = line.splitn(4, ':').nth(3) else {
        return Vec::new();
    };
    members
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{out, ScriptedSession};

    #[test]
    fn group_members_splits_exactly() {
        assert_eq!(group_members("sudo:x:27:ally,bob"), vec!["ally", "bob"]);
        assert_eq!(group_members("sudo:x:27:"), Vec::<&str>::new());
        assert_eq!(group_members("sudo:x:27"), Vec::<&str>::new());
    }

    #[tokio::test]
    async fn exists_follows_exit_code() {
        let session = ScriptedSession::new(vec![
            ("getent passwd alice", Ok(out(0, "alice:x:1000:...", ""))),
            ("getent passwd bob", Ok(out(2, "", ""))),
        ]);
        assert!(exists(&session, "alice").await.unwrap());
        assert!(!exists(&session, "bob").await.unwrap());
        session.assert_done();
    }

    #[tokio::test]
    async fn read_keys_falls_back_to_backup_when_missing() {
        let session = ScriptedSession::new(vec![
            (
                "sudo cat /home/alice/.ssh/authorized_keys",
                Ok(out(1, "", "cat: ...: No such file or directory")),
            ),
            (
                "sudo cat /home/alice/.ssh/authorized_keys.n2sysbackup",
                Ok(out(0, "ssh-ed25519 AAA alice@x\n", "")),
            ),
        ]);
        let keys = read_authorized_keys(&session, "alice").await.unwrap();
        assert_eq!(keys, "ssh-ed25519 AAA alice@x");
        session.assert_done();
    }

    #[tokio::test]
    async fn read_keys_permission_denied_is_empty_without_backup_probe() {
        let session = ScriptedSession::new(vec![(
            "sudo cat /home/alice/.ssh/authorized_keys",
            Ok(out(1, "", "cat: ...: Permission denied")),
        )]);
        let keys = read_authorized_keys(&session, "alice").await.unwrap();
        assert_eq!(keys, "");
        session.assert_done();
    }

    #[tokio::test]
    async fn disable_of_missing_keys_file_is_a_noop_success() {
        let session = ScriptedSession::new(vec![(
            "sudo cat /home/alice/.ssh/authorized_keys",
            Ok(out(1, "", "cat: ...: No such file or directory")),
        )]);
        disable(&session, "alice").await.unwrap();
        session.assert_done();
    }

    #[tokio::test]
    async fn disable_moves_keys_to_backup() {
        let session = ScriptedSession::new(vec![
            (
                "sudo cat /home/alice/.ssh/authorized_keys",
                Ok(out(0, "ssh-ed25519 AAA alice@x", "")),
            ),
            (
                "sudo mv /home/alice/.ssh/authorized_keys /home/alice/.ssh/authorized_keys.n2sysbackup",
                Ok(out(0, "", "")),
            ),
        ]);
        disable(&session, "alice").await.unwrap();
        session.assert_done();
    }

    #[tokio::test]
    async fn set_sudo_is_a_noop_when_already_member() {
        let session = ScriptedSession::new(vec![(
            "getent group sudo",
            Ok(out(0, "sudo:x:27:alice,bob", "")),
        )]);
        assert!(!set_sudo(&session, "alice", true).await.unwrap());
        session.assert_done();
    }

    #[tokio::test]
    async fn set_sudo_does_not_substring_match_members() {
        // "al" is not a member just because "ally" is listed.
        let session = ScriptedSession::new(vec![
            ("getent group sudo", Ok(out(0, "sudo:x:27:ally", ""))),
            ("sudo usermod -aG sudo al", Ok(out(0, "", ""))),
        ]);
        assert!(set_sudo(&session, "al", true).await.unwrap());
        session.assert_done();
    }

    #[tokio::test]
    async fn set_sudo_removes_unwanted_membership() {
        let session = ScriptedSession::new(vec![
            ("getent group sudo", Ok(out(0, "sudo:x:27:alice", ""))),
            ("sudo gpasswd -d alice sudo", Ok(out(0, "", ""))),
        ]);
        assert!(set_sudo(&session, "alice", false).await.unwrap());
        session.assert_done();
    }

    #[tokio::test]
    async fn enable_swaps_a_nologin_shell() {
        let session = ScriptedSession::new(vec![
            ("sudo mkdir -p /home/alice/.ssh", Ok(out(0, "", ""))),
            (
                "echo \"ssh-ed25519 AAA alice@x\" | sudo tee /home/alice/.ssh/authorized_keys",
                Ok(out(0, "ssh-ed25519 AAA alice@x", "")),
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
                Ok(out(0, "alice:x:1000:1000::/home/alice:/usr/sbin/nologin", "")),
            ),
            ("sudo usermod -s /bin/bash alice", Ok(out(0, "", ""))),
        ]);
        enable(&session, "alice", "ssh-ed25519 AAA alice@x")
            .await
            .unwrap();
        session.assert_done();
    }

    #[tokio::test]
    async fn enable_keeps_an_interactive_shell() {
        let session = ScriptedSession::new(vec![
            ("sudo mkdir -p /home/alice/.ssh", Ok(out(0, "", ""))),
            (
                "echo \"k\" | sudo tee /home/alice/.ssh/authorized_keys",
                Ok(out(0, "k", "")),
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
        ]);
        enable(&session, "alice", "k").await.unwrap();
        session.assert_done();
    }

    #[tokio::test]
    async fn create_surfaces_useradd_stderr() {
        let session = ScriptedSession::new(vec![(
            "sudo useradd alice -m -d /home/alice",
            Ok(out(1, "", "useradd: cannot lock /etc/passwd")),
        )]);
        let err = create(&session, "alice").await.unwrap_err();
        assert!(err.message().contains("cannot lock /etc/passwd"));
        session.assert_done();
    }

    #[tokio::test]
    async fn is_enabled_requires_keys_file_and_login_shell() {
        let session = ScriptedSession::new(vec![
            (
                "sudo test -f /home/alice/.ssh/authorized_keys",
                Ok(out(0, "", "")),
            ),
            (
                "getent passwd alice",
                Ok(out(0, "alice:x:1000:1000::/home/alice:/usr/sbin/nologin", "")),
            ),
            (
                "sudo test -f /home/bob/.ssh/authorized_keys",
                Ok(out(1, "", "")),
            ),
        ]);
        assert!(!is_enabled(&session, "alice").await.unwrap());
        assert!(!is_enabled(&session, "bob").await.unwrap());
        session.assert_done();
    }
}
