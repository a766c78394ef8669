//! Desired-vs-actual camera configuration synchronization.
//!
//! [`CameraSync`] owns the device handle and a path-keyed table of
//! `{current, pending, choices}` records built from the configuration tree
//! at startup.  Components above it express *desired* settings; the
//! synchronizer decides what actually needs pushing and when.
//!
//! # State machine (per setting)
//!
//! ```text
//! Clean ──set_desired(new value)──► Dirty ──apply() ok──► Clean
//!                                     │
//!                                     └──apply() rejected──► Dirty (retry)
//! ```
//!
//! Central invariant: after a reported apply success, `current == pending`
//! for every setting touched in that batch — there is no state where the
//! tracked value and a confirmed device value diverge.
//!
//! A rejected apply is not an error.  Tethered bodies refuse configuration
//! writes while mid-capture; the synchronizer waits out one bounded device
//! event and reports `false`, and the caller re-invokes until the body
//! accepts.  Per-attempt timeouts keep every wait bounded; the overall retry
//! is deliberately unbounded — during an eclipse, a stalled shot beats a
//! skipped one.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use super::{flatten, CameraDevice, CameraError, DeviceError, DeviceEvent};

// ── Desired-value type ────────────────────────────────────────────────────────

/// A desired setting value.
///
/// `Priority` carries an ordered list of acceptable values; the synchronizer
/// picks the first one the device actually offers.  This absorbs firmware
/// differences — one body calls its burst mode `Continuous high speed`,
/// another `Super high speed continuous shooting`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    Scalar(String),
    Priority(Vec<String>),
}

impl Setting {
    pub fn scalar(value: impl Into<String>) -> Self {
        Setting::Scalar(value.into())
    }

    pub fn priority<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Setting::Priority(values.into_iter().map(Into::into).collect())
    }
}

// ── Per-setting record ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SettingState {
    current: String,
    pending: Option<String>,
    choices: Option<Vec<String>>,
}

// ── CameraSync ────────────────────────────────────────────────────────────────

/// The single writer to the camera device.
pub struct CameraSync<C: CameraDevice> {
    device: C,
    table: BTreeMap<String, SettingState>,
    dirty: bool,
    event_timeout: Duration,
}

impl<C: CameraDevice> CameraSync<C> {
    /// Open the device and discover its configuration tree.
    ///
    /// `event_timeout` bounds every single wait performed while the body is
    /// busy (apply rejections and trigger retries).
    pub fn new(mut device: C, event_timeout: Duration) -> Result<Self, CameraError> {
        device.open()?;
        let tree = device.config_tree()?;
        let table: BTreeMap<String, SettingState> = flatten(&tree)
            .into_iter()
            .map(|(path, leaf)| {
                (
                    path,
                    SettingState {
                        current: leaf.value,
                        pending: None,
                        choices: leaf.choices,
                    },
                )
            })
            .collect();

        info!(settings = table.len(), "camera configuration tree discovered");

        Ok(Self {
            device,
            table,
            dirty: false,
            event_timeout,
        })
    }

    // ── Desired-state recording ───────────────────────────────────────────────

    /// Record a desired value for `path`.
    ///
    /// No-op (state stays clean) when the resolved value already matches the
    /// tracked one — re-asserting the status quo must not cost a device
    /// round-trip per poll.
    ///
    /// # Errors
    /// [`CameraError::UnknownSetting`] when `path` is not in the discovered
    /// tree; the script/device contract is static, so this is fatal.
    pub fn set_desired(&mut self, path: &str, setting: &Setting) -> Result<(), CameraError> {
        let state = self
            .table
            .get_mut(path)
            .ok_or_else(|| CameraError::UnknownSetting {
                path: path.to_string(),
            })?;

        let resolved = match setting {
            Setting::Scalar(value) => value.clone(),
            Setting::Priority(list) => {
                let Some(picked) = resolve_priority(list, state.choices.as_deref()) else {
                    return Ok(());
                };
                picked
            }
        };

        let desired = state.pending.as_deref().unwrap_or(&state.current);
        if resolved != desired {
            debug!(path, from = %desired, to = %resolved, "setting marked pending");
            state.pending = Some(resolved);
            self.dirty = true;
        }
        Ok(())
    }

    /// Record a whole map of scalar desired values.
    pub fn set_desired_map(
        &mut self,
        values: &BTreeMap<String, String>,
    ) -> Result<(), CameraError> {
        for (path, value) in values {
            self.set_desired(path, &Setting::Scalar(value.clone()))?;
        }
        Ok(())
    }

    // ── Apply ─────────────────────────────────────────────────────────────────

    /// Push all pending values to the device in one batch.
    ///
    /// Returns `true` on success (including the clean no-op case).  On
    /// rejection the pending state is kept, one bounded device event is
    /// waited out, and `false` is returned — the caller re-invokes.  A
    /// boolean rather than a `Result` because a busy body is an expected
    /// condition, not an exceptional one.
    pub fn apply(&mut self) -> bool {
        if !self.dirty {
            return true;
        }

        let batch: BTreeMap<String, String> = self
            .table
            .iter()
            .filter_map(|(path, state)| {
                state.pending.as_ref().map(|v| (path.clone(), v.clone()))
            })
            .collect();

        match self.device.set_config_values(&batch) {
            Ok(()) => {
                for state in self.table.values_mut() {
                    if let Some(value) = state.pending.take() {
                        state.current = value;
                    }
                }
                self.dirty = false;
                debug!(settings = batch.len(), "configuration batch applied");
                true
            }
            Err(err) => {
                debug!(error = %err, "configuration apply rejected; waiting for camera");
                match self.device.wait_for_event(self.event_timeout) {
                    Ok(event) => debug!(?event, "camera event while waiting to retry"),
                    Err(err) => debug!(error = %err, "event wait failed while camera busy"),
                }
                false
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    /// The locally tracked value, or an authoritative device re-read when
    /// `from_device` is set (telemetry such as battery level).
    pub fn get(&mut self, path: &str, from_device: bool) -> Result<String, CameraError> {
        if !self.table.contains_key(path) {
            return Err(CameraError::UnknownSetting {
                path: path.to_string(),
            });
        }
        if from_device {
            let value = self.device.get_config_value(path)?;
            if let Some(state) = self.table.get_mut(path) {
                if state.pending.is_none() {
                    state.current = value.clone();
                }
            }
            Ok(value)
        } else {
            Ok(self.table[path].current.clone())
        }
    }

    /// The locally tracked value without the device fallback.
    pub fn tracked(&self, path: &str) -> Option<&str> {
        self.table.get(path).map(|s| s.current.as_str())
    }

    /// Device-reported allowed choices for `path`, if constrained.
    pub fn choices(&self, path: &str) -> Option<&[String]> {
        self.table.get(path).and_then(|s| s.choices.as_deref())
    }

    /// True if every path is present in the discovered tree.
    ///
    /// Run at startup over the full set of paths the sequencer will touch so
    /// a script/device mismatch is fatal before shooting begins.
    pub fn verify_paths<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> Result<(), CameraError> {
        for path in paths {
            if !self.table.contains_key(path) {
                return Err(CameraError::UnknownSetting {
                    path: path.to_string(),
                });
            }
        }
        Ok(())
    }

    // ── Device passthroughs ───────────────────────────────────────────────────

    /// Fire one capture.  Errors are returned raw so the executor can treat
    /// them as "not yet accepted" and retry after a bounded wait.
    pub fn trigger_capture(&mut self) -> Result<(), DeviceError> {
        self.device.trigger_capture()
    }

    /// Wait up to `timeout` for the next device event.
    pub fn wait_for_event(&mut self, timeout: Duration) -> Result<DeviceEvent, DeviceError> {
        self.device.wait_for_event(timeout)
    }

    pub fn event_timeout(&self) -> Duration {
        self.event_timeout
    }

    pub fn close(&mut self) -> Result<(), DeviceError> {
        self.device.close()
    }

    /// Read access to the backend, used by the CLI for startup reporting.
    pub fn device(&self) -> &C {
        &self.device
    }

    #[cfg(test)]
    pub(crate) fn device_mut(&mut self) -> &mut C {
        &mut self.device
    }
}

/// Pick the first priority-list entry the device offers.
///
/// Falls back to the list head when nothing matches or when the setting is
/// unconstrained; an unacceptable name then surfaces at apply time.
fn resolve_priority(list: &[String], choices: Option<&[String]>) -> Option<String> {
    let first = list.first()?;
    match choices {
        Some(allowed) => list
            .iter()
            .find(|v| allowed.contains(v))
            .cloned()
            .or_else(|| Some(first.clone())),
        None => Some(first.clone()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::paths;
    use crate::camera::sim::{SimCamera, SimOp};

    fn sync() -> CameraSync<SimCamera> {
        let mut sim = SimCamera::new();
        sim.enable_op_log();
        CameraSync::new(sim, Duration::from_millis(5)).unwrap()
    }

    // ── resolve_priority ──────────────────────────────────────────────────────

    #[test]
    fn priority_picks_first_allowed_match_not_list_head() {
        let list = vec![
            "Burst".to_string(),
            "Continuous".to_string(),
            "Single".to_string(),
        ];
        let choices = ["Single".to_string(), "Continuous".to_string()];
        assert_eq!(
            resolve_priority(&list, Some(&choices)),
            Some("Continuous".to_string())
        );
    }

    #[test]
    fn priority_falls_back_to_list_head_when_nothing_matches() {
        let list = vec!["Burst".to_string(), "Sprint".to_string()];
        let choices = ["Single".to_string()];
        assert_eq!(
            resolve_priority(&list, Some(&choices)),
            Some("Burst".to_string())
        );
    }

    #[test]
    fn priority_on_unconstrained_setting_uses_list_head() {
        let list = vec!["A".to_string(), "B".to_string()];
        assert_eq!(resolve_priority(&list, None), Some("A".to_string()));
    }

    #[test]
    fn empty_priority_list_resolves_to_nothing() {
        assert_eq!(resolve_priority(&[], None), None);
    }

    // ── set_desired / dirty tracking ──────────────────────────────────────────

    #[test]
    fn startup_discovers_tree_and_is_clean() {
        let sync = sync();
        assert!(!sync.is_dirty());
        assert_eq!(sync.tracked(paths::DRIVE_MODE), Some("Single"));
    }

    #[test]
    fn set_desired_same_value_stays_clean() {
        let mut sync = sync();
        let current = sync.tracked(paths::DRIVE_MODE).unwrap().to_string();
        sync.set_desired(paths::DRIVE_MODE, &Setting::Scalar(current))
            .unwrap();
        assert!(!sync.is_dirty());
        assert!(sync.apply(), "apply on clean state is a successful no-op");
        assert!(sync.device().ops().iter().all(|op| !matches!(op, SimOp::SetBatch(_))));
    }

    #[test]
    fn set_desired_new_value_marks_dirty() {
        let mut sync = sync();
        sync.set_desired(paths::SHUTTER_SPEED, &Setting::scalar("1/4000"))
            .unwrap();
        assert!(sync.is_dirty());
    }

    #[test]
    fn unknown_path_is_fatal() {
        let mut sync = sync();
        let err = sync
            .set_desired("Nope/Not There", &Setting::scalar("x"))
            .unwrap_err();
        assert!(matches!(err, CameraError::UnknownSetting { .. }));
    }

    #[test]
    fn priority_resolution_consults_device_choices() {
        let mut sync = sync();
        sync.set_desired(
            paths::DRIVE_MODE,
            &Setting::priority(["Turbo", "Continuous high speed", "Single"]),
        )
        .unwrap();
        assert!(sync.apply());
        assert_eq!(sync.tracked(paths::DRIVE_MODE), Some("Continuous high speed"));
    }

    // ── apply ─────────────────────────────────────────────────────────────────

    #[test]
    fn successful_apply_syncs_current_and_clears_dirty() {
        let mut sync = sync();
        sync.set_desired(paths::SHUTTER_SPEED, &Setting::scalar("1/4000"))
            .unwrap();
        sync.set_desired(paths::ISO_SPEED, &Setting::scalar("800"))
            .unwrap();

        assert!(sync.apply());
        assert!(!sync.is_dirty());
        assert_eq!(sync.tracked(paths::SHUTTER_SPEED), Some("1/4000"));
        assert_eq!(sync.tracked(paths::ISO_SPEED), Some("800"));
        // and the device really saw one batch with both values
        let batches: Vec<_> = sync
            .device()
            .ops()
            .iter()
            .filter_map(|op| match op {
                SimOp::SetBatch(b) => Some(b.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][paths::SHUTTER_SPEED], "1/4000");
        assert_eq!(batches[0][paths::ISO_SPEED], "800");
    }

    #[test]
    fn rejected_apply_stays_dirty_and_later_succeeds() {
        let mut sync = sync();
        sync.device_mut().reject_next_sets(1);
        sync.set_desired(paths::SHUTTER_SPEED, &Setting::scalar("1/8000"))
            .unwrap();

        assert!(!sync.apply(), "first attempt hits the busy body");
        assert!(sync.is_dirty());
        // tracked value must not move until the device confirms
        assert_ne!(sync.tracked(paths::SHUTTER_SPEED), Some("1/8000"));

        assert!(sync.apply(), "retry succeeds once the body is idle");
        assert!(!sync.is_dirty());
        assert_eq!(sync.tracked(paths::SHUTTER_SPEED), Some("1/8000"));
    }

    #[test]
    fn second_set_desired_before_apply_batches_last_value() {
        let mut sync = sync();
        sync.set_desired(paths::ISO_SPEED, &Setting::scalar("400"))
            .unwrap();
        sync.set_desired(paths::ISO_SPEED, &Setting::scalar("1600"))
            .unwrap();
        assert!(sync.apply());
        assert_eq!(sync.tracked(paths::ISO_SPEED), Some("1600"));
    }

    // ── reads ─────────────────────────────────────────────────────────────────

    #[test]
    fn get_from_device_reads_authoritative_value() {
        let mut sync = sync();
        let battery = sync.get(paths::BATTERY_LEVEL, true).unwrap();
        assert!(!battery.is_empty());
    }

    #[test]
    fn get_tracked_avoids_the_device() {
        let mut sync = sync();
        sync.device_mut().clear_ops();
        let _ = sync.get(paths::DRIVE_MODE, false).unwrap();
        assert!(sync.device().ops().is_empty());
    }

    #[test]
    fn verify_paths_accepts_known_and_rejects_unknown() {
        let sync = sync();
        assert!(sync
            .verify_paths([paths::SHUTTER_SPEED, paths::BATTERY_LEVEL])
            .is_ok());
        assert!(matches!(
            sync.verify_paths(["Missing/Widget"]),
            Err(CameraError::UnknownSetting { .. })
        ));
    }
}
