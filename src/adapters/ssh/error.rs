// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
#[error("authentication_failure")]
pub struct AuthenticationFailure;

/// The target (or its proxy hop) could not be reached at the transport
/// level: TCP failure, name resolution, or connect timeout.
#[derive(Debug, ThisError)]
#[error("host unreachable: {0}")]
pub struct HostUnreachable(pub String);
