/*
SPDX-FileCopyrightText: Copyright 2026 The Umbra Project Authors
SPDX-License-Identifier: MIT
*/

//! Combination expansion for comma-joined setting cells.
//!
//! A shot row may list several values for one setting, e.g.
//! `ss: "1/1000,1/2000"` with `iso: "200,400"`.  One dispatched event then
//! produces the Cartesian product of every listed value – four exposures in
//! the example.  [`expand`] materialises that product as tuples in key order.
//!
//! # Expansion order
//! The **first key varies slowest**; later keys are nested innermost.  For
//! keys `[A, B]` with `A ∈ {a1, a2}` and `B ∈ {b1, b2}` the output order is
//! `(a1,b1), (a1,b2), (a2,b1), (a2,b2)`.  The order is part of the contract:
//! operators sequence their shutter-speed sweeps by writing the sweep column
//! first, and the exposures must fire in exactly that order.

use std::collections::BTreeMap;

use thiserror::Error;

// ── Error type ────────────────────────────────────────────────────────────────

/// Failure while expanding a row's setting cells.
///
/// Both variants are malformed-input conditions, surfaced during schedule
/// compilation so the loop never starts on a broken script.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpandError {
    /// The row has no cell for a required setting column.
    #[error("row is missing required setting column '{key}'")]
    MissingKey { key: String },

    /// A cell is present but resolves to an empty list element.
    ///
    /// A single value is the minimum; `"1/500,,1/1000"` or a blank cell is a
    /// script bug, not a request for zero exposures.
    #[error("setting column '{key}' contains an empty value")]
    EmptyValue { key: String },
}

// ── Expansion ─────────────────────────────────────────────────────────────────

/// Expand `row` over `keys` into the Cartesian product of each key's
/// comma-split value list.
///
/// Every returned tuple has exactly `keys.len()` entries, positionally
/// matching `keys`.  The function is pure and deterministic; the output
/// length is the product of the per-key list lengths.
///
/// # Errors
/// [`ExpandError::MissingKey`] if `row` lacks one of `keys`;
/// [`ExpandError::EmptyValue`] if any comma-split element is empty after
/// trimming.
pub fn expand(
    row: &BTreeMap<String, String>,
    keys: &[&str],
) -> Result<Vec<Vec<String>>, ExpandError> {
    let mut tuples: Vec<Vec<String>> = vec![Vec::with_capacity(keys.len())];

    for &key in keys {
        let cell = row.get(key).ok_or_else(|| ExpandError::MissingKey {
            key: key.to_string(),
        })?;

        let values = split_cell(key, cell)?;

        let mut next = Vec::with_capacity(tuples.len() * values.len());
        for prefix in &tuples {
            for value in &values {
                let mut tuple = prefix.clone();
                tuple.push(value.clone());
                next.push(tuple);
            }
        }
        tuples = next;
    }

    Ok(tuples)
}

/// Split one cell on commas, trimming surrounding whitespace per element.
fn split_cell(key: &str, cell: &str) -> Result<Vec<String>, ExpandError> {
    let values: Vec<String> = cell.split(',').map(|v| v.trim().to_string()).collect();
    if values.iter().any(|v| v.is_empty()) {
        return Err(ExpandError::EmptyValue {
            key: key.to_string(),
        });
    }
    Ok(values)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
