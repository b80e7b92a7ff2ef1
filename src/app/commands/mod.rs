// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use crate::app::errors::{codes, AppError, AppErrorKind};
use crate::app::ports::ExecOutput;

pub mod account;
pub mod inventory;

/// Every remote command carries the same per-command budget.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) fn command_failed(step: &str, out: &ExecOutput) -> AppError {
    AppError::with_message(
        AppErrorKind::Remote,
        codes::COMMAND_FAILED,
        format!("{step}: {}", out.stderr_trimmed()),
    )
}
