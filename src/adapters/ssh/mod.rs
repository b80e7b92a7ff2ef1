// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use async_trait::async_trait;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{RemoteExecPort, RemoteSessionPort};
use crate::app::types::SshTarget;

mod error;
mod session;

pub use error::{AuthenticationFailure, HostUnreachable};
pub use session::SshSession;

/// Direct targets answer fast on the fleet network; proxied targets get
/// twice the budget for the extra hop.
pub const DIRECT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const PROXIED_CONNECT_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Clone, Default)]
pub struct SshAdapter;

impl SshAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn is_transport_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.is::<HostUnreachable>() || cause.downcast_ref::<std::io::Error>().is_some()
    })
}

fn map_connect_error(err: anyhow::Error) -> AppError {
    if err.chain().any(|cause| cause.is::<AuthenticationFailure>()) {
        AppError::with_message(
            AppErrorKind::Remote,
            codes::AUTHENTICATION_FAILURE,
            format!("ssh auth failed: {err:#}"),
        )
    } else if is_transport_failure(&err) {
        AppError::with_message(
            AppErrorKind::Unreachable,
            codes::UNREACHABLE,
            format!("ssh connect failed: {err:#}"),
        )
    } else {
        AppError::with_message(
            AppErrorKind::Remote,
            codes::CONNECTION_FAILURE,
            format!("ssh connect failed: {err:#}"),
        )
    }
}

#[async_trait]
impl RemoteExecPort for SshAdapter {
    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, target),
        fields(
            op = "connect",
            host = %target.host,
            user = %target.username,
            port = target.port,
            proxied = target.proxy.is_some()
        )
    )]
    async fn connect(&self, target: &SshTarget) -> AppResult<Box<dyn RemoteSessionPort>> {
        let timeout = if target.proxy.is_some() {
            PROXIED_CONNECT_TIMEOUT
        } else {
            DIRECT_CONNECT_TIMEOUT
        };
        let session = SshSession::connect(target, timeout)
            .await
            .map_err(map_connect_error)?;
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn auth_failures_map_to_bad_key() {
        let err = anyhow::Error::new(AuthenticationFailure).context("ssh auth");
        let mapped = map_connect_error(err);
        assert_eq!(mapped.code(), codes::AUTHENTICATION_FAILURE);
        assert_eq!(mapped.kind(), AppErrorKind::Remote);
    }

    #[test]
    fn transport_failures_map_to_unreachable() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let mapped = map_connect_error(anyhow::Error::new(io).context("connecting"));
        assert_eq!(mapped.code(), codes::UNREACHABLE);
        assert!(mapped.is_unreachable());

        let timed_out = anyhow!(HostUnreachable("connect to gw1:22 timed out".to_string()));
        assert!(map_connect_error(timed_out).is_unreachable());
    }

    #[test]
    fn protocol_failures_map_to_connection_failure() {
        let mapped = map_connect_error(anyhow!("key exchange failed"));
        assert_eq!(mapped.code(), codes::CONNECTION_FAILURE);
        assert_eq!(mapped.kind(), AppErrorKind::Remote);
    }
}
