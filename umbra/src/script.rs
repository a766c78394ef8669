//! Shot-script loading.
//!
//! A shot script is a YAML file describing every planned exposure sequence:
//!
//! ```yaml
//! shots:
//!   - title: partial-wide
//!     contact: C1
//!     utc: "17:32:10"
//!     offset_sec: -5
//!     interval_sec: 30
//!     count: 4
//!     ss: "1/1000"
//!     iso: 200
//!     format: RAW
//!     white_balance: Daylight
//!     color_temperature: 5200
//! ```
//!
//! This module only gets the rows off disk; all validation (count, time
//! parsing, combination checks) happens in [`crate::schedule::compile`] so a
//! broken script fails as one typed, row-addressed error.  Setting cells are
//! coerced to strings here because the device configuration layer is
//! string-typed: `iso: 200` and `iso: "200"` are the same request.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

// ── Private YAML deserialization types ────────────────────────────────────────

/// Top-level wrapper that maps directly onto the YAML file layout.
#[derive(Debug, Deserialize)]
struct ScriptFile {
    shots: Vec<RawShotRow>,
}

/// One row as it appears in the file.
///
/// The fixed columns are named; every other column is a setting cell and is
/// collected into `settings` as-is.  Cells may be YAML numbers (spreadsheet
/// exports do this for ISO and colour temperature), so values stay untyped
/// until [`coerce_cell`] runs.
#[derive(Debug, Deserialize)]
struct RawShotRow {
    title: String,
    #[serde(default)]
    contact: Option<String>,
    utc: String,
    #[serde(default)]
    offset_sec: f64,
    #[serde(default)]
    interval_sec: f64,
    count: i64,
    #[serde(flatten)]
    settings: BTreeMap<String, serde_yaml::Value>,
}

// ── Public row type ───────────────────────────────────────────────────────────

/// One raw script row with string-coerced setting cells.
///
/// `settings` keeps comma-joined lists intact; expansion happens per dispatch
/// via [`crate::combo::expand`].
#[derive(Debug, Clone)]
pub struct ScriptRow {
    /// Track this row belongs to.
    pub title: String,
    /// Contact label for the countdown display (`C1`…`C4`), if any.
    pub contact: Option<String>,
    /// Base time of day, UTC, `HH:MM:SS` with optional fractional seconds.
    pub utc: String,
    /// Seconds added to the base time before the first shot (may be negative).
    pub offset_sec: f64,
    /// Seconds between consecutive shots of this row.
    pub interval_sec: f64,
    /// Number of shots generated from this row.
    pub count: i64,
    /// Setting columns, string-coerced, lists intact.
    pub settings: BTreeMap<String, String>,
}

/// Load and string-coerce a shot script.
///
/// # Errors
/// File and YAML-shape problems are fatal and carry the path in context;
/// non-scalar setting cells are rejected here because no later layer could
/// make sense of them.
pub fn load_script(path: &Path) -> Result<Vec<ScriptRow>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot open shot script: {}", path.display()))?;

    let file: ScriptFile = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse shot script: {}", path.display()))?;

    let mut rows = Vec::with_capacity(file.shots.len());
    for raw in file.shots {
        let mut settings = BTreeMap::new();
        for (key, value) in &raw.settings {
            let Some(text) = coerce_cell(value) else {
                bail!(
                    "shot '{}': setting column '{}' has a non-scalar value",
                    raw.title,
                    key
                );
            };
            settings.insert(key.clone(), text);
        }
        rows.push(ScriptRow {
            title: raw.title,
            contact: raw.contact,
            utc: raw.utc,
            offset_sec: raw.offset_sec,
            interval_sec: raw.interval_sec,
            count: raw.count,
            settings,
        });
    }
    Ok(rows)
}

/// Coerce one YAML cell to its textual form.
///
/// Integer-valued floats collapse to their integer text (`5200.0` → `"5200"`)
/// because spreadsheet exports widen whole numbers to floats and the device
/// wants `"5200"`, not `"5200.0"`.  Returns `None` for sequences/mappings.
fn coerce_cell(value: &serde_yaml::Value) -> Option<String> {
    use serde_yaml::Value;

    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64()?;
                if f.is_nan() {
                    Some("nan".to_string())
                } else if f.fract() == 0.0 && f.abs() < 9e15 {
                    Some(format!("{}", f as i64))
                } else {
                    Some(f.to_string())
                }
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
