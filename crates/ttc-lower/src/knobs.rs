//! Per-instruction tuning knobs.
//!
//! Knobs are ingested, never searched. A knob file is JSON keyed by
//! function name, then by instruction instance name
//! (`<intrinsic>_<counter>`, assigned in RPO collection order):
//!
//! ```json
//! {
//!   "my_func": {
//!     "tensor_matmul_0": {
//!       "TileSize_M": 2, "TileSize_N": 2, "TileSize_K": 2,
//!       "InnerLoopUnrollFactor": 4
//!     },
//!     "tensor_relu_1": { "TileSize": 2 }
//!   }
//! }
//! ```
//!
//! In print mode the engine skips lowering and writes the legal knob
//! space instead: tile sizes enumerate the divisors of the relevant
//! shape dimension capped at 128, unroll factors the range `[0, 16]`.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;

/// Knob-file errors.
#[derive(Debug, thiserror::Error)]
pub enum KnobError {
    /// File IO failed.
    #[error("knob file {path}: {source}")]
    Io {
        /// The file.
        path: String,
        /// The error.
        source: std::io::Error,
    },

    /// The file is not the expected JSON shape.
    #[error("knob file {path}: {source}")]
    Parse {
        /// The file.
        path: String,
        /// The error.
        source: serde_json::Error,
    },
}

/// Per-instruction integer knob values, keyed by function and instance
/// name.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnobSet {
    funcs: FxHashMap<String, FxHashMap<String, FxHashMap<String, i64>>>,
}

impl KnobSet {
    /// An empty set; every query falls back to the defaults.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reads a knob file.
    ///
    /// # Errors
    ///
    /// IO or JSON-shape failures.
    pub fn read_from(path: &Path) -> Result<Self, KnobError> {
        let text = std::fs::read_to_string(path).map_err(|source| KnobError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| KnobError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// The value of `key` for instruction `inst` of `func`, if present.
    #[must_use]
    pub fn get(&self, func: &str, inst: &str, key: &str) -> Option<i64> {
        self.funcs.get(func)?.get(inst)?.get(key).copied()
    }

    /// `get` as a `u32` with a default.
    #[must_use]
    pub fn get_or(&self, func: &str, inst: &str, key: &str, default: u32) -> u32 {
        self.get(func, inst, key)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(default)
    }

    /// Inserts one knob value (used by tests and programmatic tuning).
    pub fn set(&mut self, func: &str, inst: &str, key: &str, value: i64) {
        self.funcs
            .entry(func.to_owned())
            .or_default()
            .entry(inst.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
    }
}

/// The tunable space of one instruction, for print mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KnobSpace {
    /// Elementwise: one flat tile size over the innermost dimension.
    Elementwise {
        /// The innermost extent.
        last_dim: u32,
    },
    /// Matmul: M/N/K tiles plus the unroll factor.
    Matmul {
        /// The M extent.
        m: u32,
        /// The K extent.
        k: u32,
        /// The N extent.
        n: u32,
    },
    /// Transpose: row/column tiles plus the unroll factor.
    Transpose {
        /// The row extent.
        rows: u32,
        /// The column extent.
        cols: u32,
    },
}

/// All divisors of `n` that are `<= cap`, ascending.
#[must_use]
pub fn divisors_up_to(n: u32, cap: u32) -> Vec<u32> {
    let mut divisors = Vec::new();
    let mut i = 1;
    while i * i <= n {
        if n % i == 0 {
            if i <= cap {
                divisors.push(i);
            }
            let other = n / i;
            if other != i && other <= cap {
                divisors.push(other);
            }
        }
        i += 1;
    }
    divisors.sort_unstable();
    divisors
}

/// The largest divisor of `extent` not exceeding `requested`; legalizes
/// a knob so the `icmp ne` latch always terminates.
#[must_use]
pub fn largest_divisor_le(extent: u32, requested: u32) -> u32 {
    let cap = requested.clamp(1, extent.max(1));
    divisors_up_to(extent.max(1), cap)
        .last()
        .copied()
        .unwrap_or(1)
}

const DIVISOR_CAP: u32 = 128;
const UNROLL_RANGE: [i64; 2] = [0, 16];

fn divisor_entry(extent: u32) -> serde_json::Value {
    json!({ "data_type": "int", "values": divisors_up_to(extent, DIVISOR_CAP) })
}

fn unroll_entry() -> serde_json::Value {
    json!({ "data_type": "int", "data_range": UNROLL_RANGE })
}

/// Writes the knob schema for `func_name` into `path`, merging with any
/// existing file content (the function's entry is replaced).
///
/// # Errors
///
/// IO or JSON failures.
pub fn print_knobs_to(
    path: &Path,
    func_name: &str,
    entries: &[(String, KnobSpace)],
) -> Result<(), KnobError> {
    let mut inst_knobs = serde_json::Map::new();
    for (name, space) in entries {
        let mut knobs = serde_json::Map::new();
        match space {
            KnobSpace::Elementwise { last_dim } => {
                knobs.insert("TileSize".to_owned(), divisor_entry(*last_dim));
            }
            KnobSpace::Matmul { m, k, n } => {
                knobs.insert("TileSize_M".to_owned(), divisor_entry(*m));
                knobs.insert("TileSize_K".to_owned(), divisor_entry(*k));
                knobs.insert("TileSize_N".to_owned(), divisor_entry(*n));
                knobs.insert("InnerLoopUnrollFactor".to_owned(), unroll_entry());
            }
            KnobSpace::Transpose { rows, cols } => {
                knobs.insert("TileSize_M".to_owned(), divisor_entry(*rows));
                knobs.insert("TileSize_N".to_owned(), divisor_entry(*cols));
                knobs.insert("InnerLoopUnrollFactor".to_owned(), unroll_entry());
            }
        }
        inst_knobs.insert(name.clone(), serde_json::Value::Object(knobs));
    }

    // Merge with an existing file so several functions accumulate.
    let mut file_object = match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&text)
            .map_err(|source| KnobError::Parse {
                path: path.display().to_string(),
                source,
            })?,
        Err(_) => serde_json::Map::new(),
    };
    file_object.insert(
        func_name.to_owned(),
        serde_json::Value::Object(inst_knobs),
    );

    let text = serde_json::to_string_pretty(&serde_json::Value::Object(file_object))
        .expect("knob schema serializes");
    std::fs::write(path, text + "\n").map_err(|source| KnobError::Io {
        path: path.display().to_string(),
        source,
    })
}
