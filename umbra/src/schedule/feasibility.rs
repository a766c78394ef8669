/*
SPDX-FileCopyrightText: Copyright 2026 The Umbra Project Authors
SPDX-License-Identifier: MIT
*/

//! Shot-pacing feasibility analysis.
//!
//! # Status: warning only
//!
//! The check is **computed and logged** during schedule compilation; an
//! overcommitted row is still installed.  The trigger loop's window rule
//! already guarantees safety at run time — when a dispatch overruns the next
//! event, that event is dropped, not queued — so the warning exists to tell
//! the operator *before the eclipse* which rows will lose shots.
//!
//! # Model
//! One dispatched event executes `combinations` exposures back to back, each
//! costing roughly the shutter actuation plus the per-model settle delay
//! (field experience: EOS RP needs ≥ 1.3 s, EOS 6D ≥ 1.2 s, mirror lock-up
//! ≥ 1.0 s).  A row with `count > 1` must finish one dispatch inside its
//! inter-shot interval or the following event falls into the dispatch shadow.

/// Nominal wall-clock cost of one exposure, seconds.
///
/// Matches the sequencer's default settle delay; rows paced tighter than
/// this per exposure are flagged.
pub const NOMINAL_EXPOSURE_SEC: f64 = 1.5;

/// Check whether one row's dispatches fit inside its inter-shot interval.
///
/// Returns `None` when the row is comfortably paced (or has a single shot,
/// where there is no following event to shadow).
///
/// Returns `Some(needed_sec)` — the estimated duration of one dispatch —
/// when it exceeds the row's interval; the caller should `warn!` and
/// continue.
pub fn check_row_pacing(combinations: usize, interval_sec: f64, count: i64) -> Option<f64> {
    if count <= 1 {
        return None;
    }
    let needed_sec = combinations as f64 * NOMINAL_EXPOSURE_SEC;
    if needed_sec > interval_sec {
        Some(needed_sec)
    } else {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
