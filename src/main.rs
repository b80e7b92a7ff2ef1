// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use tokio::sync::watch;

mod adapters;
mod app;
mod config;
mod logging;

use app::ports::FleetStorePort;
use app::types::{NewUser, SshSettings, UserStatus};
use app::watcher::{Policy, Watcher};

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => {
            tracing::info!(
                "config path: {} (source={}, present={})",
                path.display(),
                source.as_str(),
                report.config_file_present
            );
        }
        (Some(path), None) => {
            tracing::info!(
                "config path: {} (present={})",
                path.display(),
                report.config_file_present
            );
        }
        (None, _) => {
            tracing::info!("config path: (none)");
        }
    }
    tracing::info!(
        "config database_path: {} (source={})",
        report.database_path.value.display(),
        report.database_path.source.as_str()
    );
    tracing::info!(
        "config ssh_username: {} (source={})",
        report.ssh_username.value,
        report.ssh_username.source.as_str()
    );
    tracing::info!(
        "config ssh_identity_path: {} (source={})",
        report
            .ssh_identity_path
            .value
            .as_deref()
            .unwrap_or("(default keys)"),
        report.ssh_identity_path.source.as_str()
    );
    tracing::info!(
        "config verbose: {} (source={})",
        report.verbose.value,
        report.verbose.source.as_str()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let verbose_override = parsed.verbose_override;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            database_path: opts.database_path,
            ssh_username: opts.ssh_username,
            ssh_identity_path: opts.ssh_identity_path,
            verbose: verbose_override,
        },
    )?;
    logging::init(config.verbose);
    log_config_report(&report);
    config::ensure_database_dir(&config.database_path)?;

    let store = Arc::new(adapters::db::SqliteFleetStore::open(&config.database_path).await?);

    // Recovery: a previous run may have died mid-convergence.
    let reset = store.reset_updating_accounts().await?;
    if reset > 0 {
        tracing::info!(count = reset, "requeued accounts stuck in updating");
    }

    // First start on an empty database: seed an admin so the web layer has a
    // login to bootstrap from.
    if store.count_users().await? == 0 {
        let id = store
            .insert_user(&NewUser {
                username: "admin".to_string(),
                account_name: "admin".to_string(),
                is_admin: true,
                public_key: String::new(),
                status: UserStatus::Active,
            })
            .await?;
        tracing::warn!(
            user_id = id,
            "seeded bootstrap admin user without keys; set its public key before use"
        );
    }

    let remote = Arc::new(adapters::ssh::SshAdapter::new());
    let clock = Arc::new(adapters::time::SystemClock::new());
    let ssh = SshSettings {
        username: config.ssh_username.clone(),
        identity_path: config.ssh_identity_path.clone(),
    };
    let watcher = Arc::new(Watcher::new(
        remote,
        store.clone(),
        clock,
        ssh,
        Policy::default(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(Arc::clone(&watcher).run(stop_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining in-flight tasks");
    let _ = stop_tx.send(true);
    loop_handle.await?;
    Ok(())
}
