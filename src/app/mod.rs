// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod collector;
pub mod commands;
pub mod errors;
pub mod ports;
pub mod reconciler;
pub mod types;
pub mod watcher;

#[cfg(test)]
pub mod testing;
