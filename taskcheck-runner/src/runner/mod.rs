// Copyright (c) The taskcheck Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-check supervisor.
//!
//! The main structure in this module is [`CheckRunner`]: one runner owns one
//! worker task that periodically executes its check, classifies the outcome,
//! and heartbeats the service-discovery registry.

mod imp;

pub use imp::*;
