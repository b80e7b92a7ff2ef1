// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

mod clock;
mod fleet_store;
mod remote;

pub use clock::ClockPort;
pub use fleet_store::FleetStorePort;
pub use remote::{ExecOutput, RemoteExecPort, RemoteSessionPort};
