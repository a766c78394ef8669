/*
SPDX-FileCopyrightText: Copyright 2026 The Umbra Project Authors
SPDX-License-Identifier: MIT
*/

//! Single-shot and bracket-burst execution.
//!
//! [`ExposureExecutor`] turns one concrete exposure request into the device
//! choreography around it: settings are reconciled through the
//! [`CameraSync`], the capture is fired, and the executor does not return
//! until the body reports the capture complete (or the bounded timeout
//! elapses) — commands must never overlap on a tethered body.
//!
//! Two capture modes:
//!
//! * **Single shot** — bracket off, single drive, apply, trigger, wait.  If
//!   the body still reports bracket mode enabled from an earlier burst, one
//!   harmless dummy exposure is fired first and waited out; otherwise the
//!   leftover multi-frame state corrupts the next setting change.
//! * **Bracket burst** — a continuous drive mode (picked by priority list,
//!   since firmware names differ), AE bracket width, then the virtual
//!   shutter release is pressed and held until the burst completes, and
//!   released.  This models a finger on the button, not discrete triggers.
//!
//! A rejected trigger means "not yet accepted", never failure: the executor
//! waits out one bounded device event and tries again, indefinitely.  Only
//! an unknown setting path escapes as an error, and that is caught at
//! [`initialize`](ExposureExecutor::initialize) time.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::camera::state::{CameraSync, Setting};
use crate::camera::{paths, CameraDevice, CameraError, DeviceEvent};
use crate::schedule::{is_not_applicable, BracketMode};

// ── Well-known setting values ─────────────────────────────────────────────────

pub const DRIVE_SINGLE: &str = "Single";
pub const BRACKET_OFF: &str = "Off";
pub const CAPTURE_TARGET_CARD: &str = "Memory card";

const RELEASE_PRESS: &str = "Press Full";
const RELEASE_RELEASE: &str = "Release Full";

/// Continuous drive-mode names across firmware generations, best first.
const BURST_DRIVE_MODES: [&str; 3] = [
    "Super high speed continuous shooting",
    "Continuous high speed",
    "Continuous",
];

/// Every path the executor will ever touch; verified against the device at
/// startup so a mismatch is fatal before shooting begins.
const REQUIRED_PATHS: [&str; 10] = [
    paths::CAPTURE_TARGET,
    paths::DRIVE_MODE,
    paths::SHUTTER_SPEED,
    paths::AE_BRACKETING,
    paths::ISO_SPEED,
    paths::IMAGE_FORMAT,
    paths::WHITE_BALANCE,
    paths::COLOR_TEMPERATURE,
    paths::REMOTE_RELEASE,
    paths::BATTERY_LEVEL,
];

/// Device path for a script setting column.
fn device_path(key: &str) -> Option<&'static str> {
    match key {
        "ss" => Some(paths::SHUTTER_SPEED),
        "iso" => Some(paths::ISO_SPEED),
        "format" => Some(paths::IMAGE_FORMAT),
        "white_balance" => Some(paths::WHITE_BALANCE),
        "color_temperature" => Some(paths::COLOR_TEMPERATURE),
        _ => None,
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Timing knobs for one exposure.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Pause after every exposure before the next command.  Bodies differ:
    /// EOS RP needs ≥ 1.3 s, EOS 6D ≥ 1.2 s, mirror lock-up ≥ 1.0 s.
    pub settle: Duration,
    /// Upper bound on waiting for a single capture to complete.
    pub capture_timeout: Duration,
    /// How long the virtual shutter release is held for a bracket burst.
    pub burst_hold: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(1_500),
            capture_timeout: Duration::from_secs(10),
            burst_hold: Duration::from_secs(3),
        }
    }
}

// ── ExposureExecutor ──────────────────────────────────────────────────────────

/// Executes exposures through the camera state synchronizer.
pub struct ExposureExecutor<C: CameraDevice> {
    sync: CameraSync<C>,
    cfg: ExecutorConfig,
}

impl<C: CameraDevice> ExposureExecutor<C> {
    pub fn new(sync: CameraSync<C>, cfg: ExecutorConfig) -> Self {
        Self { sync, cfg }
    }

    pub fn sync(&self) -> &CameraSync<C> {
        &self.sync
    }

    pub fn sync_mut(&mut self) -> &mut CameraSync<C> {
        &mut self.sync
    }

    /// One-time startup configuration.
    ///
    /// Verifies the full path contract, then points captures at the memory
    /// card and selects single drive.  Must run before the trigger loop —
    /// an [`CameraError::UnknownSetting`] here is the last moment it can
    /// surface cheaply.
    pub fn initialize(&mut self) -> Result<(), CameraError> {
        self.sync.verify_paths(REQUIRED_PATHS)?;
        self.sync
            .set_desired(paths::CAPTURE_TARGET, &Setting::scalar(CAPTURE_TARGET_CARD))?;
        self.sync
            .set_desired(paths::DRIVE_MODE, &Setting::scalar(DRIVE_SINGLE))?;
        self.apply_until_accepted();
        info!("camera initialised: capture to memory card, single drive");
        Ok(())
    }

    /// Execute one concrete exposure.
    ///
    /// `settings` maps script setting columns (`ss`, `iso`, …) to single
    /// values — combination lists are already expanded by the caller.
    pub fn expose(
        &mut self,
        settings: &BTreeMap<String, String>,
        bracket: &BracketMode,
    ) -> Result<(), CameraError> {
        match bracket {
            BracketMode::Off => self.single_shot(settings),
            BracketMode::Burst { width } => self.bracket_burst(settings, width),
        }
    }

    // ── Single shot ───────────────────────────────────────────────────────────

    fn single_shot(&mut self, settings: &BTreeMap<String, String>) -> Result<(), CameraError> {
        if self.bracket_still_enabled() {
            self.drain_bracket();
        }

        self.sync
            .set_desired(paths::AE_BRACKETING, &Setting::scalar(BRACKET_OFF))?;
        self.sync
            .set_desired(paths::DRIVE_MODE, &Setting::scalar(DRIVE_SINGLE))?;
        self.apply_exposure_settings(settings)?;
        self.apply_until_accepted();

        self.trigger_until_accepted();
        self.wait_capture_complete(self.cfg.capture_timeout);
        self.settle();
        Ok(())
    }

    fn bracket_still_enabled(&self) -> bool {
        self.sync
            .tracked(paths::AE_BRACKETING)
            .is_some_and(|v| v != BRACKET_OFF)
    }

    /// Fire one throwaway exposure to flush a pending bracket sequence.
    fn drain_bracket(&mut self) {
        info!("bracket mode still enabled from previous burst; draining with a dummy exposure");
        self.trigger_until_accepted();
        self.wait_capture_complete(self.cfg.capture_timeout);
    }

    // ── Bracket burst ─────────────────────────────────────────────────────────

    fn bracket_burst(
        &mut self,
        settings: &BTreeMap<String, String>,
        width: &str,
    ) -> Result<(), CameraError> {
        self.sync
            .set_desired(paths::DRIVE_MODE, &Setting::priority(BURST_DRIVE_MODES))?;
        self.sync
            .set_desired(paths::AE_BRACKETING, &Setting::scalar(width))?;
        self.apply_exposure_settings(settings)?;
        self.apply_until_accepted();

        self.sync
            .set_desired(paths::REMOTE_RELEASE, &Setting::scalar(RELEASE_PRESS))?;
        self.apply_until_accepted();
        debug!(width, "shutter release held for bracket burst");

        self.wait_capture_complete(self.cfg.burst_hold);

        self.sync
            .set_desired(paths::REMOTE_RELEASE, &Setting::scalar(RELEASE_RELEASE))?;
        self.apply_until_accepted();
        debug!("shutter release released");

        self.settle();
        Ok(())
    }

    // ── Shared steps ──────────────────────────────────────────────────────────

    /// Map script columns to device paths, dropping not-applicable values.
    fn apply_exposure_settings(
        &mut self,
        settings: &BTreeMap<String, String>,
    ) -> Result<(), CameraError> {
        for (key, value) in settings {
            let Some(path) = device_path(key) else {
                continue;
            };
            if is_not_applicable(value) {
                continue;
            }
            self.sync.set_desired(path, &Setting::Scalar(value.clone()))?;
        }
        Ok(())
    }

    /// Re-invoke `apply` until the body accepts the batch.  Each attempt is
    /// bounded by the synchronizer's event timeout; the loop is not.
    fn apply_until_accepted(&mut self) {
        let mut attempts = 0u32;
        while !self.sync.apply() {
            attempts += 1;
            debug!(attempts, "re-applying configuration batch");
        }
    }

    fn trigger_until_accepted(&mut self) {
        loop {
            match self.sync.trigger_capture() {
                Ok(()) => return,
                Err(err) => {
                    debug!(error = %err, "trigger not accepted; waiting for camera");
                    let timeout = self.sync.event_timeout();
                    match self.sync.wait_for_event(timeout) {
                        Ok(event) => debug!(?event, "camera event while waiting to retrigger"),
                        Err(err) => debug!(error = %err, "event wait failed while retriggering"),
                    }
                }
            }
        }
    }

    /// Block until the body reports the capture complete, or `total`
    /// elapses.  Other events (file added, transport chatter) are consumed
    /// and traced along the way.
    fn wait_capture_complete(&mut self, total: Duration) {
        let deadline = Instant::now() + total;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("capture-complete wait timed out; proceeding");
                return;
            }
            let step = remaining.min(self.sync.event_timeout());
            match self.sync.wait_for_event(step) {
                Ok(DeviceEvent::CaptureComplete) => {
                    debug!("capture complete");
                    return;
                }
                Ok(DeviceEvent::Timeout) => {}
                Ok(event) => debug!(?event, "device event while waiting for capture"),
                Err(err) => debug!(error = %err, "event wait failed while waiting for capture"),
            }
        }
    }

    fn settle(&self) {
        if !self.cfg.settle.is_zero() {
            std::thread::sleep(self.cfg.settle);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::sim::{SimCamera, SimOp};

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            settle: Duration::ZERO,
            capture_timeout: Duration::from_millis(50),
            burst_hold: Duration::from_millis(50),
        }
    }

    fn executor() -> ExposureExecutor<SimCamera> {
        let mut sim = SimCamera::new();
        sim.enable_op_log();
        let sync = CameraSync::new(sim, Duration::from_millis(5)).unwrap();
        ExposureExecutor::new(sync, fast_config())
    }

    fn settings(cells: &[(&str, &str)]) -> BTreeMap<String, String> {
        cells
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn plain_settings() -> BTreeMap<String, String> {
        settings(&[
            ("ss", "1/1000"),
            ("iso", "200"),
            ("format", "RAW"),
            ("white_balance", "Daylight"),
            ("color_temperature", "5200"),
        ])
    }

    fn batches_and_triggers(ops: &[SimOp]) -> Vec<&SimOp> {
        ops.iter()
            .filter(|op| matches!(op, SimOp::SetBatch(_) | SimOp::Trigger))
            .collect()
    }

    // ── initialize ────────────────────────────────────────────────────────────

    #[test]
    fn initialize_points_captures_at_memory_card() {
        let mut exec = executor();
        exec.initialize().unwrap();
        let sim = exec.sync().device();
        assert_eq!(sim.value(paths::CAPTURE_TARGET), Some("Memory card"));
        assert_eq!(sim.value(paths::DRIVE_MODE), Some("Single"));
    }

    // ── single shot ───────────────────────────────────────────────────────────

    #[test]
    fn single_shot_applies_settings_then_triggers() {
        let mut exec = executor();
        exec.sync_mut().device_mut().clear_ops();
        exec.expose(&plain_settings(), &BracketMode::Off).unwrap();

        let ops = exec.sync().device().ops();
        let seq = batches_and_triggers(ops);
        assert_eq!(seq.len(), 2, "one batch, one trigger: {seq:?}");
        match seq[0] {
            SimOp::SetBatch(batch) => {
                assert_eq!(batch[paths::SHUTTER_SPEED], "1/1000");
                assert_eq!(batch[paths::ISO_SPEED], "200");
                assert_eq!(batch[paths::WHITE_BALANCE], "Daylight");
            }
            other => panic!("expected settings batch first, got {other:?}"),
        }
        assert_eq!(seq[1], &SimOp::Trigger);
    }

    #[test]
    fn nan_color_temperature_never_reaches_the_device() {
        let mut exec = executor();
        let mut cells = plain_settings();
        cells.insert("color_temperature".into(), "nan".into());

        exec.expose(&cells, &BracketMode::Off).unwrap();
        assert_eq!(
            exec.sync().device().value(paths::COLOR_TEMPERATURE),
            Some("5200"),
            "sentinel must be omitted, not written"
        );
    }

    #[test]
    fn rejected_trigger_is_retried_until_accepted() {
        let mut exec = executor();
        exec.sync_mut().device_mut().reject_next_triggers(2);
        exec.expose(&plain_settings(), &BracketMode::Off).unwrap();

        let triggers = exec
            .sync()
            .device()
            .ops()
            .iter()
            .filter(|op| matches!(op, SimOp::Trigger))
            .count();
        assert_eq!(triggers, 1, "only the accepted trigger is recorded");
    }

    #[test]
    fn rejected_apply_is_retried_until_accepted() {
        let mut exec = executor();
        exec.sync_mut().device_mut().reject_next_sets(2);
        exec.expose(&plain_settings(), &BracketMode::Off).unwrap();
        assert_eq!(
            exec.sync().device().value(paths::SHUTTER_SPEED),
            Some("1/1000")
        );
    }

    // ── bracket burst ─────────────────────────────────────────────────────────

    #[test]
    fn bracket_burst_presses_and_releases_the_shutter() {
        let mut exec = executor();
        exec.sync_mut().device_mut().clear_ops();
        exec.expose(
            &plain_settings(),
            &BracketMode::Burst {
                width: "+/- 1".into(),
            },
        )
        .unwrap();

        let sim = exec.sync().device();
        assert_eq!(sim.value(paths::AE_BRACKETING), Some("+/- 1"));
        assert_eq!(
            sim.value(paths::DRIVE_MODE),
            Some("Continuous high speed"),
            "priority list must pick the first drive mode this body offers"
        );

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

    #[test]
    fn single_shot_after_burst_drains_with_dummy_exposure() {
        let mut exec = executor();
        exec.expose(
            &plain_settings(),
            &BracketMode::Burst {
                width: "+/- 1".into(),
            },
        )
        .unwrap();

        exec.sync_mut().device_mut().clear_ops();
        exec.expose(&plain_settings(), &BracketMode::Off).unwrap();

        let ops = exec.sync().device().ops();
        let seq = batches_and_triggers(ops);
        // dummy drain trigger fires before any setting change
        assert_eq!(seq[0], &SimOp::Trigger, "drain must precede settings: {seq:?}");
        assert!(matches!(seq[1], SimOp::SetBatch(_)));
        assert_eq!(seq[2], &SimOp::Trigger);
        assert_eq!(
            exec.sync().device().value(paths::AE_BRACKETING),
            Some("Off"),
            "single shot must turn bracket mode off"
        );
    }
}
