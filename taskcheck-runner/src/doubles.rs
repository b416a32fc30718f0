// Copyright (c) The taskcheck Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test doubles for the executor and heartbeat ports.

use crate::{
    check::CheckSpec,
    errors::{ExecError, HeartbeatError},
    executor::{ExecOutcome, ScriptExecutor},
    heartbeat::TtlReporter,
    status::CheckStatus,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;

/// Routes worker logs to the test writer. Safe to call from every test.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A spec with the given timings and fixed identifiers.
pub(crate) fn spec_with_timings(interval: Duration, timeout: Duration) -> CheckSpec {
    CheckSpec {
        allocation_id: "alloc-1".to_owned(),
        task_name: "web".to_owned(),
        check_id: "check-1".to_owned(),
        name: "up".to_owned(),
        interval,
        timeout,
        command: "/bin/true".to_owned(),
        args: Vec::new(),
    }
}

/// Returns a fixed outcome immediately.
#[derive(Debug)]
pub(crate) struct ScriptedExec {
    pub(crate) exit_code: i32,
    pub(crate) err: Option<ExecError>,
    pub(crate) output: &'static str,
}

impl ScriptedExec {
    pub(crate) fn exiting(exit_code: i32) -> Self {
        Self {
            exit_code,
            err: None,
            output: "output",
        }
    }
}

#[async_trait]
impl ScriptExecutor for ScriptedExec {
    async fn exec(&self, _timeout: Duration, _command: &str, _args: &[String]) -> ExecOutcome {
        ExecOutcome {
            output: Bytes::from_static(self.output.as_bytes()),
            exit_code: self.exit_code,
            err: self.err.clone(),
        }
    }
}

/// Never returns; the fake script never exits either.
#[derive(Debug, Default)]
pub(crate) struct BlockingExec {
    pub(crate) exited: Arc<AtomicBool>,
}

#[async_trait]
impl ScriptExecutor for BlockingExec {
    async fn exec(&self, _timeout: Duration, _command: &str, _args: &[String]) -> ExecOutcome {
        future::pending().await
    }
}

/// Honors its timeout. The fake script costs `script_cost`; if the timeout
/// elapses first, the invocation reports the canonical deadline error while
/// the script keeps "running" (`exited` stays false).
#[derive(Debug)]
pub(crate) struct TimingOutExec {
    script_cost: Duration,
    output: &'static str,
    pub(crate) exited: Arc<AtomicBool>,
}

impl TimingOutExec {
    pub(crate) fn new(script_cost: Duration, output: &'static str) -> Self {
        Self {
            script_cost,
            output,
            exited: Arc::default(),
        }
    }
}

#[async_trait]
impl ScriptExecutor for TimingOutExec {
    async fn exec(&self, timeout: Duration, _command: &str, _args: &[String]) -> ExecOutcome {
        tokio::select! {
            () = tokio::time::sleep(self.script_cost) => {
                self.exited.store(true, Ordering::SeqCst);
                ExecOutcome::exited(Bytes::from_static(self.output.as_bytes()), 0)
            }
            () = tokio::time::sleep(timeout) => {
                ExecOutcome::failed(Bytes::new(), ExecError::DeadlineExceeded)
            }
        }
    }
}

/// A heartbeat delivered to a [`RecordingTtl`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Heartbeat {
    pub(crate) check_id: String,
    pub(crate) output: String,
    pub(crate) status: CheckStatus,
}

/// Records every update on a channel the test drains. The failing variant
/// still records, then reports a delivery error, to exercise the
/// log-and-continue path.
#[derive(Debug)]
pub(crate) struct RecordingTtl {
    tx: mpsc::UnboundedSender<Heartbeat>,
    fail: bool,
}

impl RecordingTtl {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Heartbeat>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, fail: false }), rx)
    }

    pub(crate) fn failing() -> (Arc<Self>, mpsc::UnboundedReceiver<Heartbeat>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, fail: true }), rx)
    }
}

#[async_trait]
impl TtlReporter for RecordingTtl {
    async fn update_ttl(
        &self,
        check_id: &str,
        output: &str,
        status: CheckStatus,
    ) -> Result<(), HeartbeatError> {
        let _ = self.tx.send(Heartbeat {
            check_id: check_id.to_owned(),
            output: output.to_owned(),
            status,
        });
        if self.fail {
            return Err(HeartbeatError::new("registry unavailable"));
        }
        Ok(())
    }
}
