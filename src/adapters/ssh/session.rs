// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use russh::client::{AuthResult, Config};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ExecOutput, RemoteSessionPort};
use crate::app::types::SshTarget;

use super::error::{AuthenticationFailure, HostUnreachable};

/// Accepts any server key. Fleet hosts get reinstalled often and are reached
/// over an internal network, so the daemon does not pin host keys.
struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One authenticated connection to a target host, optionally tunneled
/// through a single proxy hop.
pub struct SshSession {
    handle: russh::client::Handle<ClientHandler>,
    // Keeps the direct-tcpip tunnel alive for proxied targets.
    _hop: Option<russh::client::Handle<ClientHandler>>,
}

impl SshSession {
    pub async fn connect(target: &SshTarget, timeout: Duration) -> Result<Self> {
        match tokio::time::timeout(timeout, Self::establish(target)).await {
            Ok(session) => session,
            Err(_) => Err(anyhow!(HostUnreachable(format!(
                "connect to {}:{} timed out after {}s",
                target.host,
                target.port,
                timeout.as_secs()
            )))),
        }
    }

    async fn establish(target: &SshTarget) -> Result<Self> {
        let config = Arc::new(Config {
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        match &target.proxy {
            None => {
                let mut handle = russh::client::connect(
                    config,
                    (target.host.as_str(), target.port),
                    ClientHandler,
                )
                .await?;
                authenticate(&mut handle, target).await?;
                Ok(Self {
                    handle,
                    _hop: None,
                })
            }
            Some(hop) => {
                let mut hop_handle = russh::client::connect(
                    Arc::clone(&config),
                    (hop.host.as_str(), hop.port),
                    ClientHandler,
                )
                .await
                .with_context(|| format!("proxy hop {}:{}", hop.host, hop.port))?;
                authenticate(&mut hop_handle, target)
                    .await
                    .with_context(|| format!("proxy hop {}:{}", hop.host, hop.port))?;
                let channel = hop_handle
                    .channel_open_direct_tcpip(
                        target.host.clone(),
                        u32::from(target.port),
                        "127.0.0.1",
                        0,
                    )
                    .await
                    .context("open tunnel through proxy hop")?;
                let mut handle =
                    russh::client::connect_stream(config, channel.into_stream(), ClientHandler)
                        .await?;
                authenticate(&mut handle, target).await?;
                Ok(Self {
                    handle,
                    _hop: Some(hop_handle),
                })
            }
        }
    }

    async fn exec_capture(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .context("open session")?;
        channel.exec(true, command).await.context("exec request")?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code: i32 = 0;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = exit_status as i32,
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        let _ = channel.close().await;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn disconnect(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "")
            .await;
    }
}

async fn authenticate(
    handle: &mut russh::client::Handle<ClientHandler>,
    target: &SshTarget,
) -> Result<()> {
    let path = identity_path(target)?;
    let key = russh::keys::load_secret_key(&path, None)
        .with_context(|| format!("failed to load secret key at {path}"))?;
    // Prefer SHA-256 for RSA if applicable (ignored for non-RSA keys).
    let pk = PrivateKeyWithHashAlg::new(
        Arc::new(key),
        handle.best_supported_rsa_hash().await?.flatten(),
    );
    let result = handle
        .authenticate_publickey(target.username.clone(), pk)
        .await?;
    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure { .. } => Err(AuthenticationFailure.into()),
    }
}

fn identity_path(target: &SshTarget) -> Result<String> {
    if let Some(path) = &target.identity_path {
        return Ok(path.clone());
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow!("no home directory for default keys"))?;
    for name in ["id_ed25519", "id_rsa"] {
        let candidate = home.join(".ssh").join(name);
        if candidate.exists() {
            return Ok(candidate.to_string_lossy().into_owned());
        }
    }
    Err(anyhow::Error::new(AuthenticationFailure).context("no usable SSH identity found"))
}

#[async_trait]
impl RemoteSessionPort for SshSession {
    async fn run(&self, command: &str, timeout: Duration) -> AppResult<ExecOutput> {
        match tokio::time::timeout(timeout, self.exec_capture(command)).await {
            Ok(result) => result.map_err(|err| {
                AppError::with_message(
                    AppErrorKind::Remote,
                    codes::REMOTE_ERROR,
                    format!("ssh exec failed: {err:#}"),
                )
            }),
            Err(_) => Err(AppError::with_message(
                AppErrorKind::Remote,
                codes::REMOTE_ERROR,
                format!("command timed out after {}s", timeout.as_secs()),
            )),
        }
    }

    async fn close(&self) {
        self.disconnect().await;
    }
}
