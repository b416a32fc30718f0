// Copyright (c) The taskcheck Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The TTL heartbeat port.

use crate::{errors::HeartbeatError, status::CheckStatus};
use async_trait::async_trait;

/// Delivers check status updates to the service-discovery registry.
///
/// One update renews the TTL for `check_id`; a check whose runner stops
/// heartbeating goes critical on the registry's side once the TTL lapses.
/// Errors are advisory -- the runner logs them and keeps going, letting the
/// next tick retry. Implementations must be safe for concurrent use across
/// runners.
#[async_trait]
pub trait TtlReporter: Send + Sync {
    /// Delivers one status update for `check_id`.
    async fn update_ttl(
        &self,
        check_id: &str,
        output: &str,
        status: CheckStatus,
    ) -> Result<(), HeartbeatError>;
}
