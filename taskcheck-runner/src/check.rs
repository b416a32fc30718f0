// Copyright (c) The taskcheck Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Definitions of script checks.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters for a single script health check.
///
/// A `CheckSpec` is created once per registered check and stays immutable for
/// the lifetime of its runner. The identifiers are opaque to the supervisor:
/// they correlate heartbeats and log lines with the allocation and task that
/// own the check.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckSpec {
    /// The allocation this check runs on behalf of.
    pub allocation_id: String,

    /// The task within the allocation.
    pub task_name: String,

    /// The registry-facing ID that heartbeats are addressed to.
    pub check_id: String,

    /// Diagnostic label used in logs.
    pub name: String,

    /// The gap between the end of one invocation and the start of the next.
    /// Must be positive.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Maximum wall-clock duration permitted for one invocation. Must be
    /// positive. Enforcing it is the executor's job; the runner only treats
    /// a missed deadline specially when classifying the outcome.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// The command to execute.
    pub command: String,

    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn specs_deserialize_with_human_durations() {
        let spec: CheckSpec = serde_json::from_str(
            r#"{
                "allocation-id": "a8c47600-3437-5e1c-964e-d97d4e4cd1b2",
                "task-name": "web",
                "check-id": "service:web:script-check",
                "name": "disk space",
                "interval": "30s",
                "timeout": "5s",
                "command": "/usr/local/bin/check_disk",
                "args": ["--warn", "80"]
            }"#,
        )
        .expect("spec deserializes");

        assert_eq!(spec.interval, Duration::from_secs(30));
        assert_eq!(spec.timeout, Duration::from_secs(5));
        assert_eq!(spec.args, vec!["--warn".to_owned(), "80".to_owned()]);
    }
}
