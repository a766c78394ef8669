//! Shot-script compilation into timed exposure tracks.
//!
//! [`compile`] turns raw [`ScriptRow`]s into a [`Schedule`]: one
//! [`ExposureTrack`] per distinct title, each an ascending, timestamp-
//! deduplicated sequence of [`ExposureSpec`]s, plus the contact-time list
//! used by the countdown display.
//!
//! # Design decisions
//!
//! * Tracks live in a `BTreeMap` keyed by title — iteration order is
//!   alphabetical and therefore deterministic, which the trigger loop relies
//!   on for tie-breaking between simultaneously due tracks.
//! * Events live in a `BTreeMap` keyed by timestamp — insertion in row order
//!   makes exact-timestamp collisions resolve to the **last defined row**,
//!   modelling "a later script line overrides an earlier one that lands on
//!   the same instant".
//! * Compilation is atomic: any row error aborts the whole compile and
//!   nothing is installed.

pub mod error;
pub mod feasibility;

pub use error::ScheduleError;

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use tracing::{debug, info, warn};

use crate::combo;
use crate::script::ScriptRow;

// ── Setting columns ───────────────────────────────────────────────────────────

/// Setting columns every row must carry, in expansion order.
///
/// The first key varies slowest (see [`crate::combo`]); shutter speed leads
/// so a shutter sweep fires in the order the operator wrote it.
pub const SETTING_KEYS: [&str; 5] = [
    "ss",
    "iso",
    "format",
    "white_balance",
    "color_temperature",
];

/// Optional per-row column selecting a bracket burst instead of single shots.
pub const BRACKET_KEY: &str = "bracket";

/// True for the "not applicable" sentinel family.
///
/// The device configuration layer is string-typed, so spreadsheet exports
/// leave `nan` or an empty cell where a setting does not apply (typically
/// colour temperature under auto white balance).  Such values must be
/// omitted from the desired-setting map, never sent as literal text.  A real
/// value of `"0"` is not a sentinel.
pub fn is_not_applicable(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("nan")
}

// ── Bracket mode ──────────────────────────────────────────────────────────────

/// Per-event capture mode.
///
/// The canonical "no bracket" form is [`BracketMode::Off`]; the aliases seen
/// in scripts in the wild (`off`, `nan`, `single`, empty cell, absent
/// column) all normalise to it at compile time.  Anything else is taken as
/// the auto-exposure-bracket width (e.g. `"+/- 1"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BracketMode {
    Off,
    Burst { width: String },
}

impl BracketMode {
    /// Normalise a raw bracket cell.
    pub fn parse(cell: Option<&str>) -> Self {
        match cell {
            None => BracketMode::Off,
            Some(raw) => {
                let v = raw.trim();
                if is_not_applicable(v)
                    || v.eq_ignore_ascii_case("off")
                    || v.eq_ignore_ascii_case("single")
                {
                    BracketMode::Off
                } else {
                    BracketMode::Burst {
                        width: v.to_string(),
                    }
                }
            }
        }
    }

    pub fn is_burst(&self) -> bool {
        matches!(self, BracketMode::Burst { .. })
    }
}

// ── Event and track types ─────────────────────────────────────────────────────

/// Desired settings for one scheduled event.
///
/// `settings` keeps the row's comma-joined lists intact; the trigger loop
/// expands them into concrete exposures at dispatch time.
#[derive(Debug, Clone)]
pub struct ExposureSpec {
    pub settings: BTreeMap<String, String>,
    pub bracket: BracketMode,
}

/// A named, independently scheduled sequence of exposures.
///
/// Owned by the trigger scheduler; the only mutation after compilation is
/// [`mark_fired`](Self::mark_fired), which advances the `last_fired` cursor
/// and never moves it backward.
#[derive(Debug, Clone)]
pub struct ExposureTrack {
    pub title: String,
    events: BTreeMap<DateTime<Utc>, ExposureSpec>,
    last_fired: DateTime<Utc>,
}

impl ExposureTrack {
    fn new(title: String, start: DateTime<Utc>) -> Self {
        Self {
            title,
            events: BTreeMap::new(),
            last_fired: start,
        }
    }

    /// The due event for a poll at `now`: the **latest** event in the
    /// half-open window `(last_fired, now]`.
    ///
    /// Earlier events inside the same window are intentionally not returned;
    /// once the cursor advances past them they are dropped forever, so the
    /// camera never works through a backlog of stale shots.
    pub fn due_event(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, &ExposureSpec)> {
        if now <= self.last_fired {
            return None;
        }
        self.events
            .range((Excluded(self.last_fired), Included(now)))
            .next_back()
            .map(|(at, spec)| (*at, spec))
    }

    /// Advance the cursor to the poll time.
    ///
    /// Always the poll's `now`, never an event's own timestamp, and never
    /// backward — this is what guarantees monotonic progress per track.
    pub fn mark_fired(&mut self, now: DateTime<Utc>) {
        if now > self.last_fired {
            self.last_fired = now;
        }
    }

    pub fn last_fired(&self) -> DateTime<Utc> {
        self.last_fired
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All events in timestamp order.
    pub fn events(&self) -> btree_map::Iter<'_, DateTime<Utc>, ExposureSpec> {
        self.events.iter()
    }

    pub fn first_at(&self) -> Option<DateTime<Utc>> {
        self.events.keys().next().copied()
    }

    pub fn last_at(&self) -> Option<DateTime<Utc>> {
        self.events.keys().next_back().copied()
    }
}

/// A fully compiled schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Track title → track, alphabetically ordered.
    pub tracks: BTreeMap<String, ExposureTrack>,
    /// Contact label → timestamp; read-only, countdown display only.
    pub contacts: BTreeMap<String, DateTime<Utc>>,
}

impl Schedule {
    /// Startup dump: one summary line per track and contact, individual
    /// events at debug level.
    pub fn log_summary(&self) {
        for (title, track) in &self.tracks {
            info!(
                track = %title,
                events = track.len(),
                first = %fmt_opt_time(track.first_at()),
                last = %fmt_opt_time(track.last_at()),
                "track compiled"
            );
            for (at, spec) in track.events() {
                debug!(
                    track = %title,
                    at = %at.format("%H:%M:%S%.3f"),
                    bracket = spec.bracket.is_burst(),
                    settings = ?spec.settings,
                    "scheduled event"
                );
            }
        }
        for (label, at) in &self.contacts {
            info!(contact = %label, at = %at.format("%H:%M:%S"), "contact time");
        }
    }
}

fn fmt_opt_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "-".to_string())
}

// ── Compilation ───────────────────────────────────────────────────────────────

/// Compile script rows into a [`Schedule`].
///
/// For a row with `count = C`, events fire at
/// `base_date + utc + offset_sec + i * interval_sec` for `i ∈ [0, C)`.
/// Rows sharing a title merge into one track; exact-timestamp duplicates
/// resolve to the later-defined row.  Every track's cursor starts at
/// `start`, so events already in the past when the sequencer comes up are
/// not replayed.
///
/// # Errors
/// Any malformed row aborts the compile; see [`ScheduleError`].  The
/// expander runs once per row here purely as validation, so a missing or
/// empty setting column can never surface mid-dispatch.
pub fn compile(
    rows: &[ScriptRow],
    base_date: NaiveDate,
    start: DateTime<Utc>,
) -> Result<Schedule, ScheduleError> {
    if rows.is_empty() {
        return Err(ScheduleError::EmptyScript);
    }

    let mut tracks: BTreeMap<String, ExposureTrack> = BTreeMap::new();
    let mut contacts: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();

    for (index, row) in rows.iter().enumerate() {
        if row.count <= 0 {
            return Err(ScheduleError::NonPositiveCount {
                row: index,
                title: row.title.clone(),
                count: row.count,
            });
        }

        let time_of_day = parse_time_of_day(&row.utc).ok_or_else(|| {
            ScheduleError::UnparseableTime {
                row: index,
                title: row.title.clone(),
                value: row.utc.clone(),
            }
        })?;

        let combinations = combo::expand(&row.settings, &SETTING_KEYS)
            .map_err(|source| ScheduleError::Expand {
                row: index,
                title: row.title.clone(),
                source,
            })?
            .len();

        if let Some(needed_sec) =
            feasibility::check_row_pacing(combinations, row.interval_sec, row.count)
        {
            warn!(
                row = index,
                track = %row.title,
                combinations,
                interval_sec = row.interval_sec,
                needed_sec,
                "row may overrun its interval; later shots in the window will be dropped"
            );
        }

        let base = DateTime::<Utc>::from_naive_utc_and_offset(
            base_date.and_time(time_of_day),
            Utc,
        );

        if let Some(label) = &row.contact {
            // last value per label wins
            contacts.insert(label.clone(), base);
        }

        let spec = ExposureSpec {
            settings: row.settings.clone(),
            bracket: BracketMode::parse(row.settings.get(BRACKET_KEY).map(String::as_str)),
        };

        let track = tracks
            .entry(row.title.clone())
            .or_insert_with(|| ExposureTrack::new(row.title.clone(), start));

        for i in 0..row.count {
            let seconds = row.offset_sec + i as f64 * row.interval_sec;
            let at = base + Duration::milliseconds((seconds * 1_000.0).round() as i64);
            // BTreeMap insert overwrites: last-defined row wins on collision
            track.events.insert(at, spec.clone());
        }

        debug!(
            row = index,
            track = %row.title,
            count = row.count,
            combinations,
            bracket = spec.bracket.is_burst(),
            "row compiled"
        );
    }

    Ok(Schedule { tracks, contacts })
}

/// Parse `HH:MM:SS` with optional fractional seconds.
fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    let v = value.trim();
    NaiveTime::parse_from_str(v, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(v, "%H:%M:%S"))
        .ok()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
