//! Deterministic simulated camera body.
//!
//! Stands in for a tethered body during rehearsals and in every test: a
//! Canon-like configuration tree, scriptable transient rejections, a queue
//! of device events, and an optional operation log the tests assert against.
//!
//! The simulator models the two behaviours the sequencer's retry logic
//! exists for: a busy body rejecting configuration writes or triggers
//! ([`reject_next_sets`](SimCamera::reject_next_sets) /
//! [`reject_next_triggers`](SimCamera::reject_next_triggers)), and capture
//! completion arriving later as a queued [`DeviceEvent::CaptureComplete`].
//! It accepts any value for a constrained setting — real transports differ
//! on enforcement, and the sequencer must not rely on the device to police
//! choice membership.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use super::{paths, CameraDevice, ConfigNode, DeviceError, DeviceEvent};

/// Longest real sleep the simulator performs for an empty event wait.
///
/// Keeps the [`DeviceEvent::Timeout`] contract honest without stalling
/// rehearsals or tests behind multi-second timeouts.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(10);

// ── Operation log ─────────────────────────────────────────────────────────────

/// One recorded device operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    Open,
    Close,
    SetBatch(BTreeMap<String, String>),
    Trigger,
}

// ── SimCamera ─────────────────────────────────────────────────────────────────

/// Simulated camera body.
pub struct SimCamera {
    open: bool,
    values: BTreeMap<String, String>,
    reject_sets: u32,
    reject_triggers: u32,
    events: VecDeque<DeviceEvent>,
    ops: Vec<SimOp>,
    log_ops: bool,
    frame_counter: u32,
}

impl SimCamera {
    pub fn new() -> Self {
        let values = [
            (paths::CAPTURE_TARGET, "Internal RAM"),
            (paths::DRIVE_MODE, "Single"),
            (paths::SHUTTER_SPEED, "1/125"),
            (paths::AE_BRACKETING, "Off"),
            (paths::ISO_SPEED, "100"),
            (paths::IMAGE_FORMAT, "RAW"),
            (paths::WHITE_BALANCE, "Auto"),
            (paths::COLOR_TEMPERATURE, "5200"),
            (paths::REMOTE_RELEASE, "None"),
            (paths::BATTERY_LEVEL, "100%"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            open: false,
            values,
            reject_sets: 0,
            reject_triggers: 0,
            events: VecDeque::new(),
            ops: Vec::new(),
            log_ops: false,
            frame_counter: 0,
        }
    }

    /// Record every operation for later assertions.  Off by default so a
    /// long rehearsal does not accumulate an unbounded log.
    pub fn enable_op_log(&mut self) {
        self.log_ops = true;
    }

    pub fn ops(&self) -> &[SimOp] {
        &self.ops
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Reject the next `n` configuration batches with [`DeviceError::Busy`].
    pub fn reject_next_sets(&mut self, n: u32) {
        self.reject_sets = n;
    }

    /// Reject the next `n` capture triggers with [`DeviceError::Busy`].
    pub fn reject_next_triggers(&mut self, n: u32) {
        self.reject_triggers = n;
    }

    /// Push an event for the next `wait_for_event` call.
    pub fn queue_event(&mut self, event: DeviceEvent) {
        self.events.push_back(event);
    }

    /// Current value of a configuration entry.
    pub fn value(&self, path: &str) -> Option<&str> {
        self.values.get(path).map(String::as_str)
    }

    fn record(&mut self, op: SimOp) {
        if self.log_ops {
            self.ops.push(op);
        }
    }

    fn complete_capture(&mut self) {
        self.frame_counter += 1;
        self.events.push_back(DeviceEvent::CaptureComplete);
        self.events
            .push_back(DeviceEvent::FileAdded(format!("IMG_{:04}.CR2", self.frame_counter)));
    }

    fn leaf(&self, path: &str, choices: Option<&[&str]>) -> ConfigNode {
        let label = path.rsplit('/').next().unwrap_or(path).to_string();
        ConfigNode::Leaf {
            label,
            value: self.values[path].clone(),
            choices: choices.map(|c| c.iter().map(|s| s.to_string()).collect()),
        }
    }
}

impl Default for SimCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDevice for SimCamera {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.open = true;
        self.record(SimOp::Open);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.open = false;
        self.record(SimOp::Close);
        Ok(())
    }

    fn config_tree(&mut self) -> Result<ConfigNode, DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        let tree = ConfigNode::Section {
            label: "Camera and Driver Configuration".to_string(),
            children: vec![
                ConfigNode::Section {
                    label: "Camera Settings".to_string(),
                    children: vec![self.leaf(
                        paths::CAPTURE_TARGET,
                        Some(&["Internal RAM", "Memory card"]),
                    )],
                },
                ConfigNode::Section {
                    label: "Capture Settings".to_string(),
                    children: vec![
                        self.leaf(
                            paths::DRIVE_MODE,
                            Some(&[
                                "Single",
                                "Continuous low speed",
                                "Continuous high speed",
                                "Self-timer: 10 sec",
                            ]),
                        ),
                        self.leaf(paths::SHUTTER_SPEED, None),
                        self.leaf(
                            paths::AE_BRACKETING,
                            Some(&["Off", "+/- 1/3", "+/- 2/3", "+/- 1", "+/- 2"]),
                        ),
                    ],
                },
                ConfigNode::Section {
                    label: "Image Settings".to_string(),
                    children: vec![
                        self.leaf(paths::ISO_SPEED, None),
                        self.leaf(paths::IMAGE_FORMAT, None),
                        self.leaf(paths::WHITE_BALANCE, None),
                        self.leaf(paths::COLOR_TEMPERATURE, None),
                    ],
                },
                ConfigNode::Section {
                    label: "Actions".to_string(),
                    children: vec![self.leaf(
                        paths::REMOTE_RELEASE,
                        Some(&[
                            "None",
                            "Press Half",
                            "Press Full",
                            "Release Half",
                            "Release Full",
                        ]),
                    )],
                },
                ConfigNode::Section {
                    label: "Camera Status".to_string(),
                    children: vec![self.leaf(paths::BATTERY_LEVEL, None)],
                },
            ],
        };
        Ok(tree)
    }

    fn get_config_value(&mut self, path: &str) -> Result<String, DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        self.values
            .get(path)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownPath(path.to_string()))
    }

    fn set_config_values(&mut self, values: &BTreeMap<String, String>) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        if self.reject_sets > 0 {
            self.reject_sets -= 1;
            return Err(DeviceError::Busy("body is mid-capture".to_string()));
        }
        for path in values.keys() {
            if !self.values.contains_key(path) {
                return Err(DeviceError::UnknownPath(path.clone()));
            }
        }
        for (path, value) in values {
            self.values.insert(path.clone(), value.clone());
        }
        self.record(SimOp::SetBatch(values.clone()));

        // holding the virtual shutter release completes a burst shortly after
        if values.get(paths::REMOTE_RELEASE).map(String::as_str) == Some("Press Full") {
            self.complete_capture();
        }
        Ok(())
    }

    fn trigger_capture(&mut self) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        if self.reject_triggers > 0 {
            self.reject_triggers -= 1;
            return Err(DeviceError::Busy("previous capture still draining".to_string()));
        }
        self.record(SimOp::Trigger);
        self.complete_capture();
        Ok(())
    }

    fn wait_for_event(&mut self, timeout: Duration) -> Result<DeviceEvent, DeviceError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        std::thread::sleep(timeout.min(MAX_IDLE_WAIT));
        Ok(DeviceEvent::Timeout)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
