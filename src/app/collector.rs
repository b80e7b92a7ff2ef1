// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Per-server inventory collection, doubling as the liveness probe.
//!
//! The connect phase and the collection phase fail differently on purpose:
//! "could not reach the host" and "reached it but a privileged command
//! failed" call for different remediation, so they map to different server
//! statuses.

use crate::app::commands::inventory;
use crate::app::errors::{codes, AppError, AppErrorKind, AppResult};
use crate::app::ports::{ClockPort, FleetStorePort, RemoteExecPort, RemoteSessionPort};
use crate::app::types::{NicKind, ServerRecord, ServerStatus, SshSettings, SshTarget};

/// Collect inventory for one server and write every fact straight to the
/// store. Store errors are returned; remote failures are absorbed into the
/// server status.
pub async fn collect_server(
    remote: &dyn RemoteExecPort,
    store: &dyn FleetStorePort,
    clock: &dyn ClockPort,
    ssh: &SshSettings,
    server: &ServerRecord,
    proxy: Option<&ServerRecord>,
) -> AppResult<()> {
    let target = SshTarget::for_server(server, proxy, ssh);
    let session = match remote.connect(&target).await {
        Ok(session) => session,
        Err(err) => {
            let status = connect_failure_status(&err);
            tracing::warn!(
                host = %server.host,
                status = status.as_str(),
                error = %err,
                "server connect failed"
            );
            return store.set_server_status(server.id, status).await;
        }
    };
    store
        .set_server_status(server.id, ServerStatus::Active)
        .await?;

    let result = collect_over(session.as_ref(), store, clock, server).await;
    session.close().await;
    match result {
        Ok(()) => {
            store.mark_server_collected(server.id, clock.now_utc()).await?;
            tracing::info!(host = %server.host, "server inventory collected");
            Ok(())
        }
        Err(err) if err.kind() == AppErrorKind::Internal => Err(err),
        Err(err) => {
            tracing::warn!(host = %server.host, error = %err, "server collection failed");
            store
                .set_server_status(server.id, ServerStatus::NoPermission)
                .await
        }
    }
}

async fn collect_over(
    session: &dyn RemoteSessionPort,
    store: &dyn FleetStorePort,
    clock: &dyn ClockPort,
    server: &ServerRecord,
) -> Result<(), AppError> {
    let kernel = inventory::kernel_version(session).await?;
    let os = inventory::os_release(session).await?;
    store
        .set_server_facts(server.id, &kernel, &os)
        .await
        .map_err(internal)?;

    for kind in [NicKind::Ethernet, NicKind::Infiniband] {
        for probe in inventory::nics(session, kind).await? {
            store
                .upsert_interface(server.id, &probe)
                .await
                .map_err(internal)?;
        }
    }

    let accounts = store
        .list_login_accounts_for_server(server.id)
        .await
        .map_err(internal)?;
    for account in accounts {
        let at = inventory::last_login(session, &account.account_name, clock.now_utc()).await?;
        if let Some(at) = at {
            store
                .advance_last_login(account.account_id, at)
                .await
                .map_err(internal)?;
        }
    }
    Ok(())
}

// Store failures mid-collection are not the server's fault; keep them apart
// from remote failures so they never land in NO_PERMISSION.
fn internal(err: AppError) -> AppError {
    if err.kind() == AppErrorKind::Internal {
        err
    } else {
        AppError::with_message(AppErrorKind::Internal, codes::INTERNAL_ERROR, err.to_string())
    }
}

fn connect_failure_status(err: &AppError) -> ServerStatus {
    match err.code() {
        codes::UNREACHABLE => ServerStatus::Unreachable,
        codes::AUTHENTICATION_FAILURE => ServerStatus::BadKey,
        _ => ServerStatus::SshError,
    }
}
