// Copyright (c) The taskcheck Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by taskcheck.

use std::{error, io, sync::Arc};
use thiserror::Error;

/// An error reported by a [`ScriptExecutor`](crate::executor::ScriptExecutor)
/// invocation.
///
/// The display string of the error is what the registry sees as the check's
/// output when the check goes critical because of it.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ExecError {
    /// The command did not complete within its allotted timeout.
    ///
    /// The display string of this variant is the canonical deadline message;
    /// it is published verbatim in place of whatever the script printed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The command could not be spawned.
    #[error("failed to spawn command: {0}")]
    Spawn(Arc<io::Error>),

    /// The command spawned but its exit status could not be collected.
    #[error("failed to wait for command: {0}")]
    Wait(Arc<io::Error>),

    /// The supervisor failed internally while driving the invocation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// Returns true for the canonical deadline-exceeded error.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, ExecError::DeadlineExceeded)
    }
}

/// An error delivering a TTL heartbeat to the registry.
///
/// Heartbeat errors are advisory: the runner logs them at warn level and
/// carries on, so a flaky registry costs at most the ticks it was down for.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HeartbeatError {
    message: String,
    #[source]
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

impl HeartbeatError {
    /// Creates a new heartbeat error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new heartbeat error with an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// An error that occurred while setting up OS signal delivery for the
/// shutdown broadcast.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalSetupError(#[from] io::Error);
