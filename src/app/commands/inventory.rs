// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Read-only inventory probes. Inventory gaps are tolerated: a failed probe
//! yields an empty value, never an error, so one broken tool on a host does
//! not abort the rest of the collection.

use time::{OffsetDateTime, PrimitiveDateTime};

use crate::app::errors::AppResult;
use crate::app::ports::RemoteSessionPort;
use crate::app::types::{NicKind, NicProbe};

use super::COMMAND_TIMEOUT;

/// `last -F` prints wall-clock timestamps in this shape: `Mon Aug 25 10:12:02 2026`.
const LAST_TIMESTAMP: &[time::format_description::BorrowedFormatItem<'_>] = time::macros::format_description!(
    "[weekday repr:short] [month repr:short] [day padding:none] [hour]:[minute]:[second] [year]"
);

/// Kernel release, or empty when the probe fails.
pub async fn kernel_version(session: &dyn RemoteSessionPort) -> AppResult<String> {
    let out = session.run("uname -r", COMMAND_TIMEOUT).await?;
    if !out.ok() {
        return Ok(String::new());
    }
    Ok(out.stdout_trimmed().to_string())
}

/// One-line OS release description, or empty when the probe fails or the
/// release files carry no `DISTRIB_DESCRIPTION` entry.
pub async fn os_release(session: &dyn RemoteSessionPort) -> AppResult<String> {
    let out = session
        .run(
            "cat /etc/*release | grep -i DISTRIB_DESCRIPTION",
            COMMAND_TIMEOUT,
        )
        .await?;
    if !out.ok() {
        return Ok(String::new());
    }
    Ok(parse_release(out.stdout_trimmed()))
}

fn parse_release(line: &str) -> String {
    match line.split_once('=') {
        Some((_, value)) => value.trim().replace('"', ""),
        None => String::new(),
    }
}

/// Enumerate PCI NICs of one kind and correlate them with interface names
/// via `/sys/class/net`. A failed `lspci` yields no NICs; a failed interface
/// walk yields NICs without names.
pub async fn nics(session: &dyn RemoteSessionPort, kind: NicKind) -> AppResult<Vec<NicProbe>> {
    let out = session
        .run(
            &format!("lspci -D | grep -i {}", kind.pci_filter()),
            COMMAND_TIMEOUT,
        )
        .await?;
    if !out.ok() {
        return Ok(Vec::new());
    }
    let mut probes = parse_lspci(&out.stdout);
    if probes.is_empty() {
        return Ok(probes);
    }

    let out = session.run("ls /sys/class/net", COMMAND_TIMEOUT).await?;
    if !out.ok() {
        return Ok(probes);
    }
    for interface in out.stdout.split_whitespace() {
        let out = session
            .run(
                &format!("readlink /sys/class/net/{interface}/device"),
                COMMAND_TIMEOUT,
            )
            .await?;
        if !out.ok() {
            continue;
        }
        let Some(pci_address) = out.stdout_trimmed().rsplit('/').next() else {
            continue;
        };
        if let Some(probe) = probes.iter_mut().find(|p| p.pci_address == pci_address) {
            probe.interface = Some(interface.to_string());
        }
    }
    Ok(probes)
}

fn parse_lspci(stdout: &str) -> Vec<NicProbe> {
    stdout
        .lines()
        .filter_map(|line| {
            let (pci_address, description) = line.split_once(' ')?;
            let description = description.trim();
            if description.is_empty() {
                return None;
            }
            Some(NicProbe {
                pci_address: pci_address.to_string(),
                description: description.to_string(),
                interface: None,
            })
        })
        .collect()
}

/// Most recent login time of `account` on this host. An open session counts
/// as a login "now". `None` when the account never logged in, the probe
/// fails, or the output cannot be parsed; the caller applies the monotonic
/// advance rule and so never regresses on `None`.
pub async fn last_login(
    session: &dyn RemoteSessionPort,
    account: &str,
    now: OffsetDateTime,
) -> AppResult<Option<OffsetDateTime>> {
    let out = session
        .run(&format!("last -F {account}"), COMMAND_TIMEOUT)
        .await?;
    if !out.ok() {
        return Ok(None);
    }
    // Entries are newest-first; the trailer line ("wtmp begins ...") and
    // blank lines are skipped by the account-name match.
    for line in out.stdout.lines() {
        if line.split_whitespace().next() != Some(account) {
            continue;
        }
        if line.contains("still logged in") {
            return Ok(Some(now));
        }
        return Ok(parse_last_line(line));
    }
    Ok(None)
}

/// First `last -F` timestamp on the line (the login time). The host column
/// is not always present, so the timestamp is located by its weekday token
/// rather than by field position. Remote wall-clock times are recorded as
/// UTC.
fn parse_last_line(line: &str) -> Option<OffsetDateTime> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let start = tokens.iter().position(|t| {
        matches!(*t, "Mon" | "Tue" | "Wed" | "Thu" | "Fri" | "Sat" | "Sun")
    })?;
    let stamp = tokens.get(start..start + 5)?.join(" ");
    PrimitiveDateTime::parse(&stamp, LAST_TIMESTAMP)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::app::testing::{out, ScriptedSession};

    #[test]
    fn release_line_is_unquoted() {
        assert_eq!(
            parse_release("DISTRIB_DESCRIPTION=\"Ubuntu 22.04.4 LTS\""),
            "Ubuntu 22.04.4 LTS"
        );
        assert_eq!(parse_release("garbage"), "");
    }

    #[test]
    fn lspci_lines_split_into_address_and_description() {
        let probes = parse_lspci(
            "0000:3b:00.0 Ethernet controller: Intel Corporation I350\n0000:5e:00.0 Infiniband controller: Mellanox ConnectX-6\nshort\n",
        );
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[0].pci_address, "0000:3b:00.0");
        assert_eq!(probes[0].description, "Ethernet controller: Intel Corporation I350");
        assert_eq!(probes[0].interface, None);
    }

    #[test]
    fn last_line_yields_the_login_time() {
        let at = parse_last_line(
            "alice    pts/0        10.0.0.5         Mon Aug 25 10:12:02 2026 - Mon Aug 25 11:00:00 2026  (00:47)",
        );
        assert_eq!(at, Some(datetime!(2026-08-25 10:12:02 UTC)));
    }

    #[test]
    fn last_line_without_host_column_still_parses() {
        let at = parse_last_line(
            "alice    tty1         Tue Aug 5 09:00:00 2025 - Tue Aug 5 09:30:00 2025  (00:30)",
        );
        assert_eq!(at, Some(datetime!(2025-08-05 09:00:00 UTC)));
    }

    #[tokio::test]
    async fn failed_probes_yield_empty_facts() {
        let session = ScriptedSession::new(vec![
            ("uname -r", Ok(out(127, "", "uname: not found"))),
            (
                "cat /etc/*release | grep -i DISTRIB_DESCRIPTION",
                Ok(out(1, "", "")),
            ),
        ]);
        assert_eq!(kernel_version(&session).await.unwrap(), "");
        assert_eq!(os_release(&session).await.unwrap(), "");
        session.assert_done();
    }

    #[tokio::test]
    async fn nics_correlate_interface_names_by_pci_address() {
        let session = ScriptedSession::new(vec![
            (
                "lspci -D | grep -i ethernet",
                Ok(out(
                    0,
                    "0000:3b:00.0 Ethernet controller: Intel I350\n0000:3b:00.1 Ethernet controller: Intel I350\n",
                    "",
                )),
            ),
            ("ls /sys/class/net", Ok(out(0, "eno1\nlo\n", ""))),
            (
                "readlink /sys/class/net/eno1/device",
                Ok(out(0, "../../../0000:3b:00.0\n", "")),
            ),
            ("readlink /sys/class/net/lo/device", Ok(out(1, "", ""))),
        ]);
        let probes = nics(&session, NicKind::Ethernet).await.unwrap();
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[0].interface.as_deref(), Some("eno1"));
        assert_eq!(probes[1].interface, None);
        session.assert_done();
    }

    #[tokio::test]
    async fn nics_survive_a_failed_interface_walk() {
        let session = ScriptedSession::new(vec![
            (
                "lspci -D | grep -i infiniband",
                Ok(out(0, "0000:5e:00.0 Infiniband controller: Mellanox\n", "")),
            ),
            ("ls /sys/class/net", Ok(out(1, "", "ls: cannot access"))),
        ]);
        let probes = nics(&session, NicKind::Infiniband).await.unwrap();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].interface, None);
        session.assert_done();
    }

    #[tokio::test]
    async fn still_logged_in_counts_as_now() {
        let now = datetime!(2026-08-26 12:00:00 UTC);
        let session = ScriptedSession::new(vec![(
            "last -F alice",
            Ok(out(
                0,
                "alice    pts/0        10.0.0.5         Wed Aug 26 11:58:00 2026   still logged in\n\nwtmp begins Thu Jan  1 00:00:00 2026\n",
                "",
            )),
        )]);
        let at = last_login(&session, "alice", now).await.unwrap();
        assert_eq!(at, Some(now));
        session.assert_done();
    }

    #[tokio::test]
    async fn no_entries_yield_none() {
        let now = datetime!(2026-08-26 12:00:00 UTC);
        let session = ScriptedSession::new(vec![(
            "last -F alice",
            Ok(out(0, "\nwtmp begins Thu Jan  1 00:00:00 2026\n", "")),
        )]);
        assert_eq!(last_login(&session, "alice", now).await.unwrap(), None);
        session.assert_done();
    }
}
