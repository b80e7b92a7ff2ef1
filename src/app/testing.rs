// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Shared test fakes. Sessions are scripted: each expected command is paired
//! with its result, consumed in order, and any deviation panics so a test
//! never silently runs different remote commands than it claims to.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::app::errors::AppResult;
use crate::app::ports::{ClockPort, ExecOutput, RemoteExecPort, RemoteSessionPort};
use crate::app::types::SshTarget;

pub fn out(exit_code: i32, stdout: &str, stderr: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

pub struct ScriptedSession {
    steps: Mutex<VecDeque<(String, AppResult<ExecOutput>)>>,
}

impl ScriptedSession {
    pub fn new(steps: Vec<(&str, AppResult<ExecOutput>)>) -> Self {
        Self {
            steps: Mutex::new(
                steps
                    .into_iter()
                    .map(|(command, result)| (command.to_string(), result))
                    .collect(),
            ),
        }
    }

    pub fn assert_done(&self) {
        let steps = self.steps.lock().expect("steps lock");
        assert!(
            steps.is_empty(),
            "{} scripted command(s) never ran, next: {:?}",
            steps.len(),
            steps.front().map(|(command, _)| command)
        );
    }
}

#[async_trait]
impl RemoteSessionPort for ScriptedSession {
    async fn run(&self, command: &str, _timeout: Duration) -> AppResult<ExecOutput> {
        let mut steps = self.steps.lock().expect("steps lock");
        let Some((expected, result)) = steps.pop_front() else {
            panic!("unexpected command: {command}");
        };
        assert_eq!(command, expected);
        result
    }

    async fn close(&self) {}
}

/// Hands out scripted sessions per target host, in connect order.
pub struct ScriptedRemote {
    sessions: Mutex<HashMap<String, VecDeque<AppResult<ScriptedSession>>>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn expect_connect(self, host: &str, session: AppResult<ScriptedSession>) -> Self {
        self.sessions
            .lock()
            .expect("sessions lock")
            .entry(host.to_string())
            .or_default()
            .push_back(session);
        self
    }

    pub fn assert_done(&self) {
        let sessions = self.sessions.lock().expect("sessions lock");
        for (host, queue) in sessions.iter() {
            assert!(
                queue.is_empty(),
                "{} scripted connect(s) to {host} never happened",
                queue.len()
            );
        }
    }
}

#[async_trait]
impl RemoteExecPort for ScriptedRemote {
    async fn connect(&self, target: &SshTarget) -> AppResult<Box<dyn RemoteSessionPort>> {
        let session = self
            .sessions
            .lock()
            .expect("sessions lock")
            .get_mut(&target.host)
            .and_then(VecDeque::pop_front);
        let Some(session) = session else {
            panic!("unexpected connect to {}", target.host);
        };
        session.map(|s| Box::new(s) as Box<dyn RemoteSessionPort>)
    }
}

pub struct FixedClock(pub OffsetDateTime);

impl ClockPort for FixedClock {
    fn now_utc(&self) -> OffsetDateTime {
        self.0
    }
}
