//! Wall-clock polling loop and cross-track arbitration.
//!
//! [`TriggerScheduler`] owns the compiled [`Schedule`] and the
//! [`ExposureExecutor`] and runs the cooperative main loop.  Each poll:
//!
//! 1. Read the (possibly shifted) clock.
//! 2. Per track, find the due event: the **latest** event in the half-open
//!    window `(last_fired, now]`.  Events overtaken inside one window are
//!    dropped, never queued — the camera must not chew through a backlog of
//!    stale shots after a slow dispatch.
//! 3. Across tracks, dispatch only the **single oldest-timestamped** due
//!    event; the camera is a mutually exclusive resource.  Other due tracks
//!    keep their cursors and win a later poll.  Timestamp ties go to the
//!    alphabetically first track (tracks live in a `BTreeMap`), so the
//!    outcome is deterministic.
//! 4. Expand the event's comma lists into concrete exposures and execute
//!    them sequentially, blocking the loop until all are done.
//! 5. Advance the dispatched track's `last_fired` to `now` — the poll time,
//!    not the event's timestamp — so progress is monotonic even when
//!    several events collapsed into one window.
//!
//! One iteration therefore dispatches at most one event; the loop sleeps a
//! short bounded interval between polls, and the operator countdown (contact
//! deltas plus live battery telemetry) is emitted at most once per wall-clock
//! second regardless of the poll rate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::camera::{paths, CameraDevice, CameraError};
use crate::clock::EventClock;
use crate::combo;
use crate::executor::ExposureExecutor;
use crate::schedule::{Schedule, SETTING_KEYS};

/// Result of one dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub track: String,
    pub at: DateTime<Utc>,
    pub exposures: usize,
}

/// The main sequencing loop.  Sole owner of every track cursor.
pub struct TriggerScheduler<C: CameraDevice> {
    schedule: Schedule,
    executor: ExposureExecutor<C>,
    clock: EventClock,
    poll_interval: Duration,
    last_countdown_sec: Option<i64>,
}

impl<C: CameraDevice> TriggerScheduler<C> {
    pub fn new(
        schedule: Schedule,
        executor: ExposureExecutor<C>,
        clock: EventClock,
        poll_interval: Duration,
    ) -> Self {
        Self {
            schedule,
            executor,
            clock,
            poll_interval,
            last_countdown_sec: None,
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn executor(&self) -> &ExposureExecutor<C> {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut ExposureExecutor<C> {
        &mut self.executor
    }

    // ── One poll ──────────────────────────────────────────────────────────────

    /// Evaluate one poll at `now`; dispatch at most one event.
    ///
    /// Split out from [`run`](Self::run) so the window and arbitration rules
    /// are directly testable with injected timestamps.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Option<DispatchOutcome>, CameraError> {
        // oldest due event across tracks; strict < keeps the first
        // (alphabetical) track on a tie
        let mut best: Option<(DateTime<Utc>, String)> = None;
        for (title, track) in &self.schedule.tracks {
            if let Some((at, _)) = track.due_event(now) {
                if best.as_ref().map_or(true, |(best_at, _)| at < *best_at) {
                    best = Some((at, title.clone()));
                }
            }
        }
        let Some((at, title)) = best else {
            return Ok(None);
        };
        let Some(spec) = self
            .schedule
            .tracks
            .get(&title)
            .and_then(|t| t.due_event(now))
            .map(|(_, spec)| spec.clone())
        else {
            return Ok(None);
        };

        let combinations = match combo::expand(&spec.settings, &SETTING_KEYS) {
            Ok(c) => c,
            Err(err) => {
                // compile() validated every row, so this indicates a bug;
                // skip the event rather than wedge the loop
                error!(track = %title, error = %err, "due event failed expansion; skipping");
                if let Some(track) = self.schedule.tracks.get_mut(&title) {
                    track.mark_fired(now);
                }
                return Ok(None);
            }
        };

        info!(
            track = %title,
            at = %at.format("%H:%M:%S%.3f"),
            exposures = combinations.len(),
            bracket = spec.bracket.is_burst(),
            "dispatching due event"
        );

        for tuple in &combinations {
            let cells: BTreeMap<String, String> = SETTING_KEYS
                .iter()
                .map(|k| k.to_string())
                .zip(tuple.iter().cloned())
                .collect();
            info!(track = %title, settings = ?cells, "exposure");
            self.executor.expose(&cells, &spec.bracket)?;
        }

        if let Some(track) = self.schedule.tracks.get_mut(&title) {
            track.mark_fired(now);
        }

        Ok(Some(DispatchOutcome {
            track: title,
            at,
            exposures: combinations.len(),
        }))
    }

    // ── The loop ──────────────────────────────────────────────────────────────

    /// Poll until `stop` is set.
    ///
    /// The stop flag is checked between iterations only — a dispatch in
    /// flight always completes, so the camera is never abandoned mid-burst.
    pub async fn run(&mut self, stop: &AtomicBool) -> Result<(), CameraError> {
        info!(
            tracks = self.schedule.tracks.len(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "sequencer running"
        );
        loop {
            if stop.load(Ordering::Relaxed) {
                info!("stop requested; sequencer halting");
                return Ok(());
            }
            let now = self.clock.now();
            self.log_countdown(now);
            if let Some(outcome) = self.tick(now)? {
                debug!(
                    track = %outcome.track,
                    exposures = outcome.exposures,
                    "dispatch finished"
                );
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Countdown-to-contact line, at most once per wall-clock second.
    fn log_countdown(&mut self, now: DateTime<Utc>) {
        let sec = now.timestamp();
        if self.last_countdown_sec == Some(sec) {
            return;
        }
        self.last_countdown_sec = Some(sec);

        let battery = self
            .executor
            .sync_mut()
            .get(paths::BATTERY_LEVEL, true)
            .unwrap_or_else(|_| "?".to_string());

        let mut contacts: Vec<(&String, &DateTime<Utc>)> =
            self.schedule.contacts.iter().collect();
        contacts.sort_by_key(|(_, at)| **at);
        let countdown = contacts
            .iter()
            .map(|(label, at)| {
                let abbrev: String = label.chars().take(3).collect();
                format!("{}:{:+}", abbrev, (**at - now).num_seconds())
            })
            .collect::<Vec<_>>()
            .join(" ");

        info!(
            now = %now.format("%H:%M:%S"),
            battery = %battery,
            contacts = %countdown,
            "countdown"
        );
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::sim::{SimCamera, SimOp};
    use crate::camera::state::CameraSync;
    use crate::executor::ExecutorConfig;
    use crate::schedule;
    use crate::script::ScriptRow;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 12, h, m, s).unwrap()
    }

    fn row(title: &str, utc: &str, offset: f64, interval: f64, count: i64) -> ScriptRow {
        let settings = [
            ("ss", "1/1000"),
            ("iso", "200"),
            ("format", "RAW"),
            ("white_balance", "Daylight"),
            ("color_temperature", "5200"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        ScriptRow {
            title: title.to_string(),
            contact: None,
            utc: utc.to_string(),
            offset_sec: offset,
            interval_sec: interval,
            count,
            settings,
        }
    }

    fn scheduler(rows: &[ScriptRow], start: DateTime<Utc>) -> TriggerScheduler<SimCamera> {
        let sched = schedule::compile(
            rows,
            chrono::NaiveDate::from_ymd_opt(2026, 8, 12).unwrap(),
            start,
        )
        .unwrap();
        let mut sim = SimCamera::new();
        sim.enable_op_log();
        let sync = CameraSync::new(sim, Duration::from_millis(5)).unwrap();
        let executor = ExposureExecutor::new(
            sync,
            ExecutorConfig {
                settle: Duration::ZERO,
                capture_timeout: Duration::from_millis(50),
                burst_hold: Duration::from_millis(50),
            },
        );
        TriggerScheduler::new(sched, executor, EventClock::new(0), Duration::from_millis(50))
    }

    fn sim_ops(s: &TriggerScheduler<SimCamera>) -> Vec<SimOp> {
        s.executor().sync().device().ops().to_vec()
    }

    // ── window logic ──────────────────────────────────────────────────────────

    #[test]
    fn coarse_poll_dispatches_only_latest_and_drops_earlier() {
        // events at 17:00:10 and 17:00:12, cursor starts at 17:00:09
        let rows = vec![row("wide", "17:00:10", 0.0, 2.0, 2)];
        let mut s = scheduler(&rows, at(17, 0, 9));

        let outcome = s.tick(at(17, 0, 13)).unwrap().unwrap();
        assert_eq!(outcome.at, at(17, 0, 12));

        // the overtaken 17:00:10 event is gone forever
        assert_eq!(s.tick(at(17, 0, 20)).unwrap(), None);
    }

    #[test]
    fn nothing_due_dispatches_nothing() {
        let rows = vec![row("wide", "17:00:10", 0.0, 2.0, 2)];
        let mut s = scheduler(&rows, at(17, 0, 0));
        assert_eq!(s.tick(at(17, 0, 5)).unwrap(), None);
        assert!(sim_ops(&s)
            .iter()
            .all(|op| !matches!(op, SimOp::Trigger | SimOp::SetBatch(_))));
    }

    #[test]
    fn last_fired_advances_to_poll_time_not_event_time() {
        let rows = vec![row("wide", "17:00:10", 0.0, 2.0, 2)];
        let mut s = scheduler(&rows, at(17, 0, 9));

        let now = at(17, 0, 13);
        s.tick(now).unwrap().unwrap();
        assert_eq!(s.schedule().tracks["wide"].last_fired(), now);
    }

    // ── cross-track arbitration ───────────────────────────────────────────────

    #[test]
    fn oldest_due_event_wins_and_loser_fires_next_poll() {
        // track a due at 17:01:40, track b at 17:01:41; both observed at :45
        let rows = vec![
            row("a", "17:01:40", 0.0, 0.0, 1),
            row("b", "17:01:41", 0.0, 0.0, 1),
        ];
        let mut s = scheduler(&rows, at(17, 0, 0));

        let first = s.tick(at(17, 1, 45)).unwrap().unwrap();
        assert_eq!(first.track, "a");
        assert_eq!(first.at, at(17, 1, 40));

        // b stayed pending because only a's cursor advanced
        let second = s.tick(at(17, 1, 46)).unwrap().unwrap();
        assert_eq!(second.track, "b");
        assert_eq!(second.at, at(17, 1, 41));

        let third = s.tick(at(17, 1, 47)).unwrap();
        assert_eq!(third, None);
    }

    #[test]
    fn timestamp_tie_breaks_alphabetically() {
        let rows = vec![
            row("zeta", "17:00:10", 0.0, 0.0, 1),
            row("alpha", "17:00:10", 0.0, 0.0, 1),
        ];
        let mut s = scheduler(&rows, at(17, 0, 0));
        let first = s.tick(at(17, 0, 11)).unwrap().unwrap();
        assert_eq!(first.track, "alpha");
    }

    #[test]
    fn one_dispatch_per_tick_even_with_many_due_tracks() {
        let rows = vec![
            row("a", "17:00:10", 0.0, 0.0, 1),
            row("b", "17:00:10", 0.0, 0.0, 1),
            row("c", "17:00:10", 0.0, 0.0, 1),
        ];
        let mut s = scheduler(&rows, at(17, 0, 0));
        assert!(s.tick(at(17, 0, 11)).unwrap().is_some());
        let triggers = sim_ops(&s)
            .iter()
            .filter(|op| matches!(op, SimOp::Trigger))
            .count();
        assert_eq!(triggers, 1, "the camera is exclusive; one event per tick");
    }

    // ── combination dispatch ──────────────────────────────────────────────────

    #[test]
    fn comma_lists_expand_into_sequential_exposures() {
        let mut r = row("sweep", "17:00:10", 0.0, 0.0, 1);
        r.settings.insert("ss".into(), "1/1000,1/2000".into());
        let mut s = scheduler(&[r], at(17, 0, 0));

        let outcome = s.tick(at(17, 0, 11)).unwrap().unwrap();
        assert_eq!(outcome.exposures, 2);

        let triggers = sim_ops(&s)
            .iter()
            .filter(|op| matches!(op, SimOp::Trigger))
            .count();
        assert_eq!(triggers, 2);
        // the last exposure of the sweep left the slower value behind
        assert_eq!(
            s.executor().sync().device().value(paths::SHUTTER_SPEED),
            Some("1/2000")
        );
    }

    // ── end-to-end: bracket then single ───────────────────────────────────────

    #[test]
    fn bracket_burst_then_single_shot_drains_in_between() {
        let mut burst_row = row("main", "17:00:10", 0.0, 0.0, 1);
        burst_row
            .settings
            .insert("bracket".into(), "+/- 1".into());
        let single_row = row("main", "17:00:20", 0.0, 0.0, 1);

        let mut s = scheduler(&[burst_row, single_row], at(17, 0, 0));

        // burst event
        let first = s.tick(at(17, 0, 11)).unwrap().unwrap();
        assert_eq!(first.at, at(17, 0, 10));
        {
            let sim = s.executor().sync().device();
            assert_eq!(sim.value(paths::AE_BRACKETING), Some("+/- 1"));
            assert_eq!(sim.value(paths::DRIVE_MODE), Some("Continuous high speed"));
            let releases: Vec<&str> = sim
                .ops()
                .iter()
                .filter_map(|op| match op {
                    SimOp::SetBatch(b) => b.get(paths::REMOTE_RELEASE).map(String::as_str),
                    _ => None,
                })
                .collect();
            assert_eq!(releases, vec!["Press Full", "Release Full"]);
        }

        // single-shot event: dummy drain first, then bracket off
        s.executor_mut().sync_mut().device_mut().clear_ops();
        let second = s.tick(at(17, 0, 21)).unwrap().unwrap();
        assert_eq!(second.at, at(17, 0, 20));

        let ops: Vec<SimOp> = sim_ops(&s)
            .into_iter()
            .filter(|op| matches!(op, SimOp::Trigger | SimOp::SetBatch(_)))
            .collect();
        assert_eq!(
            ops[0],
            SimOp::Trigger,
            "leftover bracket state must be drained before settings change"
        );
        let sim = s.executor().sync().device();
        assert_eq!(sim.value(paths::AE_BRACKETING), Some("Off"));
        assert_eq!(sim.value(paths::DRIVE_MODE), Some("Single"));
    }

    // ── run loop ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn run_halts_when_stop_is_set() {
        let rows = vec![row("wide", "17:00:10", 0.0, 0.0, 1)];
        let mut s = scheduler(&rows, at(17, 0, 0));
        let stop = AtomicBool::new(true);
        s.run(&stop).await.unwrap();
    }
}
