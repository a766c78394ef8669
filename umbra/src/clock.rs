//! Event clock with a configurable rehearsal shift.
//!
//! Contact times are absolute UTC, so a dry run of an 17:00 UTC contact would
//! normally require waiting until 17:00 UTC.  [`EventClock`] adds a fixed
//! whole-hour shift to the wall clock instead: with `--shift-hours 3` at
//! 14:00 UTC the sequencer believes it is 17:00 UTC and the full timeline can
//! be rehearsed in the afternoon.  A shift of zero is the live configuration.

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Wall clock used by the trigger loop and the schedule compiler.
#[derive(Debug, Clone, Copy)]
pub struct EventClock {
    shift: Duration,
}

impl EventClock {
    /// Clock shifted by a whole number of hours (may be negative).
    pub fn new(shift_hours: i64) -> Self {
        Self {
            shift: Duration::hours(shift_hours),
        }
    }

    /// Clock with an arbitrary shift, used by tests for sub-hour offsets.
    pub fn with_shift(shift: Duration) -> Self {
        Self { shift }
    }

    /// Current shifted time.
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.shift
    }

    /// The date the schedule's times-of-day are anchored to.
    ///
    /// Derived from the shifted clock so that a rehearsal started "yesterday
    /// evening plus eighteen hours" still lands on the event's calendar day.
    pub fn base_date(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

impl Default for EventClock {
    fn default() -> Self {
        Self::new(0)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
