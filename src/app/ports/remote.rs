// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::SshTarget;

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// One authenticated remote shell session.
///
/// A timed-out command surfaces as an error, like any other failure.
/// Sessions must be closed by the owning task when it is done, on every
/// exit path.
#[async_trait]
pub trait RemoteSessionPort: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> AppResult<ExecOutput>;
    async fn close(&self);
}

/// Remote session establishment boundary.
///
/// Connect errors are typed through `AppError`: `AppErrorKind::Unreachable`
/// means the target (or its proxy hop) could not be reached at all, so the
/// caller can record server status accordingly.
#[async_trait]
pub trait RemoteExecPort: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> AppResult<Box<dyn RemoteSessionPort>>;
}
