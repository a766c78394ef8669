/*
SPDX-FileCopyrightText: Copyright 2026 The Umbra Project Authors
SPDX-License-Identifier: MIT
*/

//! Structured error types for schedule compilation.
//!
//! Every variant is fatal and surfaced before the trigger loop starts: a
//! schedule is either installed whole or not at all, and a script bug must
//! never be discovered mid-eclipse.  Each variant carries the row index and
//! track title so the operator can fix the script line directly.

use thiserror::Error;

use crate::combo::ExpandError;

/// Top-level error returned by [`compile`](super::compile).
///
/// **Do not** collapse these into `anyhow::Error` inside the library — the
/// structured variants are matched by tests and by the CLI's exit reporting.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The script parsed but contains no shot rows at all.
    #[error("shot script contains no rows")]
    EmptyScript,

    /// A row requests zero or negative shots.
    #[error("row {row} ('{title}'): shot count must be positive, got {count}")]
    NonPositiveCount {
        row: usize,
        title: String,
        count: i64,
    },

    /// A row's base time of day could not be parsed.
    #[error("row {row} ('{title}'): cannot parse base time '{value}' as HH:MM:SS")]
    UnparseableTime {
        row: usize,
        title: String,
        value: String,
    },

    /// A row's setting cells failed combination expansion (missing or empty
    /// column).  Checked at compile time so the dispatch path cannot hit it
    /// mid-event.
    #[error("row {row} ('{title}'): {source}")]
    Expand {
        row: usize,
        title: String,
        source: ExpandError,
    },
}
