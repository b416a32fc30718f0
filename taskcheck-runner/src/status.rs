// Copyright (c) The taskcheck Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Check statuses and the mapping from execution outcomes to them.

use crate::executor::ExecOutcome;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt};

/// The health of a check as understood by the registry.
///
/// The string values cross the wire to the service-discovery registry and
/// are stable across versions.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// The script exited 0.
    Passing,
    /// The script exited 1.
    Warning,
    /// Any other exit code, an execution error, or a missed deadline.
    Critical,
}

impl CheckStatus {
    /// Returns the wire representation of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passing => "passing",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps one execution outcome to the status published for it.
///
/// The whole mapping lives in this one match so that the "any execution
/// error means critical" row holds for every exit code, including
/// pathological ones.
pub fn classify(outcome: &ExecOutcome) -> CheckStatus {
    match (outcome.deadline_exceeded(), &outcome.err, outcome.exit_code) {
        (true, _, _) => CheckStatus::Critical,
        (_, Some(_), _) => CheckStatus::Critical,
        (_, None, 0) => CheckStatus::Passing,
        (_, None, 1) => CheckStatus::Warning,
        (_, None, _) => CheckStatus::Critical,
    }
}

/// Selects the output published alongside [`classify`]'s status.
///
/// A missed deadline publishes the canonical deadline message, any other
/// execution error publishes the error text, and a clean run publishes the
/// captured script output.
pub fn heartbeat_output(outcome: &ExecOutcome) -> Cow<'_, str> {
    match &outcome.err {
        Some(err) => Cow::Owned(err.to_string()),
        None => String::from_utf8_lossy(&outcome.output),
    }
}
