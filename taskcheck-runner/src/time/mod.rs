// Copyright (c) The taskcheck Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Instrumentation for how long check invocations take.

mod stopwatch;

pub(crate) use stopwatch::*;
