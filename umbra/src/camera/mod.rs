/*
SPDX-FileCopyrightText: Copyright 2026 The Umbra Project Authors
SPDX-License-Identifier: MIT
*/

//! Camera device interface.
//!
//! The sequencer never talks to camera hardware directly; it drives any
//! backend implementing [`CameraDevice`].  The trait mirrors what tethered-
//! capture transports actually offer: a device-reported configuration tree
//! of named widgets, batch configuration writes that a busy body may reject,
//! fire-and-forget capture triggers, and a bounded event wait.
//!
//! Setting paths are slash-delimited label paths into the configuration
//! tree (`Camera and Driver Configuration/Capture Settings/Shutter Speed`).
//! [`flatten`] walks the tree once at startup and turns every leaf widget
//! into one lookup entry keyed by its full path; the
//! [`state::CameraSync`] built on top of that table is the **single
//! writer** to the device — no other component holds the handle.

pub mod sim;
pub mod state;

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

// ── Well-known setting paths ──────────────────────────────────────────────────

/// Label paths for the settings the sequencer drives.
///
/// The leading section names follow the layout tethered Canon bodies report;
/// a backend for a different vendor maps these in its `config_tree`.
pub mod paths {
    pub const CAPTURE_TARGET: &str =
        "Camera and Driver Configuration/Camera Settings/Capture Target";
    pub const DRIVE_MODE: &str =
        "Camera and Driver Configuration/Capture Settings/Drive Mode";
    pub const SHUTTER_SPEED: &str =
        "Camera and Driver Configuration/Capture Settings/Shutter Speed";
    pub const AE_BRACKETING: &str =
        "Camera and Driver Configuration/Capture Settings/Auto Exposure Bracketing";
    pub const ISO_SPEED: &str =
        "Camera and Driver Configuration/Image Settings/ISO Speed";
    pub const IMAGE_FORMAT: &str =
        "Camera and Driver Configuration/Image Settings/Image Format";
    pub const WHITE_BALANCE: &str =
        "Camera and Driver Configuration/Image Settings/WhiteBalance";
    pub const COLOR_TEMPERATURE: &str =
        "Camera and Driver Configuration/Image Settings/Color Temperature";
    pub const REMOTE_RELEASE: &str =
        "Camera and Driver Configuration/Actions/Remote Release";
    pub const BATTERY_LEVEL: &str =
        "Camera and Driver Configuration/Camera Status/Battery Level";
}

// ── Device events ─────────────────────────────────────────────────────────────

/// Event returned by [`CameraDevice::wait_for_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The full timeout elapsed without the device reporting anything.
    Timeout,
    /// A capture sequence finished and the body is ready for commands.
    CaptureComplete,
    /// A new image file appeared on the capture target.
    FileAdded(String),
    /// Anything else the transport surfaces; payload is transport-specific.
    Unknown(String),
}

// ── Error types ───────────────────────────────────────────────────────────────

/// Transport-level failure from a [`CameraDevice`] call.
///
/// `Busy` and `Io` are the *expected* transient rejections of a body that is
/// mid-capture; callers recover with a bounded event wait and a retry, and
/// log at debug level only.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("camera is busy: {0}")]
    Busy(String),

    #[error("camera transport failure: {0}")]
    Io(String),

    #[error("camera reports no configuration entry at '{0}'")]
    UnknownPath(String),

    #[error("camera is not open")]
    NotOpen,
}

/// Failure in the configuration contract between script and device.
///
/// Unlike [`DeviceError`]'s transient variants these are fatal: the set of
/// setting paths is static for a session, so an unknown path means the
/// script and the connected body disagree and shooting must not start.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("setting path '{path}' does not exist on the connected camera")]
    UnknownSetting { path: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

// ── Configuration tree ────────────────────────────────────────────────────────

/// One node of the device-reported configuration tree.
#[derive(Debug, Clone)]
pub enum ConfigNode {
    /// An interior widget grouping child widgets.
    Section {
        label: String,
        children: Vec<ConfigNode>,
    },
    /// A leaf widget holding one value, optionally constrained to choices.
    Leaf {
        label: String,
        value: String,
        choices: Option<Vec<String>>,
    },
}

/// Flattened view of one leaf widget.
#[derive(Debug, Clone)]
pub struct ConfigLeaf {
    pub value: String,
    pub choices: Option<Vec<String>>,
}

/// Walk the tree and produce the path-keyed leaf table.
///
/// Every leaf becomes exactly one entry keyed by its slash-joined label
/// path, root label included.
pub fn flatten(root: &ConfigNode) -> BTreeMap<String, ConfigLeaf> {
    let mut table = BTreeMap::new();
    flatten_into(root, String::new(), &mut table);
    table
}

fn flatten_into(node: &ConfigNode, prefix: String, table: &mut BTreeMap<String, ConfigLeaf>) {
    match node {
        ConfigNode::Section { label, children } => {
            let prefix = join_path(&prefix, label);
            for child in children {
                flatten_into(child, prefix.clone(), table);
            }
        }
        ConfigNode::Leaf {
            label,
            value,
            choices,
        } => {
            table.insert(
                join_path(&prefix, label),
                ConfigLeaf {
                    value: value.clone(),
                    choices: choices.clone(),
                },
            );
        }
    }
}

fn join_path(prefix: &str, label: &str) -> String {
    if prefix.is_empty() {
        label.to_string()
    } else {
        format!("{prefix}/{label}")
    }
}

// ── Device trait ──────────────────────────────────────────────────────────────

/// Abstract camera transport.
///
/// All methods are synchronous; anything that can block takes an explicit
/// bounded timeout.  Implementations must honour the [`DeviceEvent::Timeout`]
/// contract — a `Timeout` result means the timeout actually elapsed, so
/// callers may poll in a loop without spinning.
pub trait CameraDevice {
    fn open(&mut self) -> Result<(), DeviceError>;

    fn close(&mut self) -> Result<(), DeviceError>;

    /// The full configuration tree as the device reports it right now.
    fn config_tree(&mut self) -> Result<ConfigNode, DeviceError>;

    /// Authoritative re-read of a single value (telemetry such as battery
    /// level, where locally tracked state is meaningless).
    fn get_config_value(&mut self, path: &str) -> Result<String, DeviceError>;

    /// Push a batch of values in one transaction.  A busy body rejects the
    /// whole batch with [`DeviceError::Busy`].
    fn set_config_values(&mut self, values: &BTreeMap<String, String>) -> Result<(), DeviceError>;

    /// Fire one capture.  Fire-and-forget: completion arrives later as a
    /// [`DeviceEvent::CaptureComplete`].
    fn trigger_capture(&mut self) -> Result<(), DeviceError>;

    /// Wait up to `timeout` for the next device event.
    fn wait_for_event(&mut self, timeout: Duration) -> Result<DeviceEvent, DeviceError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
