//! Session state, options, and configuration for TTC.
//!
//! [`Options`] is the configuration record threaded through the whole
//! pipeline: knob file paths and modes, the default tile sizes used when
//! a knob file says nothing, the buffer seeding policy, the modeled
//! vector register width, and the optional 2-D tile-register matmul
//! mode. Tuning state lives here rather than in globals so two sessions
//! with different settings can coexist in one process.

#![warn(missing_docs)]

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// How the engine interacts with knob files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnobMode {
    /// No knob file; compile with defaults.
    #[default]
    Defaults,
    /// Skip lowering; write the legal knob space to the given file.
    Print(Utf8PathBuf),
    /// Read per-instruction knob values from the given file.
    Read(Utf8PathBuf),
}

/// Compiler options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Knob file handling.
    pub knob_mode: KnobMode,
    /// Default elementwise tile size.
    pub tile_size: u32,
    /// Default matmul/transpose row tile.
    pub tile_size_m: u32,
    /// Default matmul/transpose column tile.
    pub tile_size_n: u32,
    /// Default matmul reduction tile.
    pub tile_size_k: u32,
    /// Default innermost-loop unroll factor (0 = none).
    pub inner_loop_unroll_factor: u32,
    /// Seed tensor buffers with memcpy (true) or typed stores (false).
    pub init_with_memcpy: bool,
    /// Modeled vector register width in bits, for kernel block sizes.
    pub register_bits: u32,
    /// Lower matmul through 2-D tile-register intrinsics.
    pub tile_registers: bool,
    /// Tile register rows (2-D tile mode).
    pub tile_reg_rows: u32,
    /// Tile register columns (2-D tile mode).
    pub tile_reg_cols: u32,
    /// Dump each function after lowering.
    pub dump_ir: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            knob_mode: KnobMode::Defaults,
            tile_size: 2,
            tile_size_m: 4,
            tile_size_n: 4,
            tile_size_k: 10,
            inner_loop_unroll_factor: 0,
            init_with_memcpy: true,
            register_bits: 128,
            tile_registers: false,
            tile_reg_rows: 2,
            tile_reg_cols: 2,
            dump_ir: false,
        }
    }
}

/// Errors raised by session setup.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// An option value out of range.
    #[error("invalid option: {0}")]
    InvalidOption(String),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A compiler session: options plus the working directory.
pub struct Session {
    /// The options for this session.
    pub options: Options,
    working_dir: Utf8PathBuf,
}

impl Session {
    /// Creates a session with the given options.
    ///
    /// # Errors
    ///
    /// Fails if an option is out of range or the working directory
    /// cannot be determined.
    pub fn new(options: Options) -> Result<Self, SessionError> {
        if options.tile_size == 0
            || options.tile_size_m == 0
            || options.tile_size_n == 0
            || options.tile_size_k == 0
        {
            return Err(SessionError::InvalidOption(
                "tile sizes must be positive".to_owned(),
            ));
        }
        if options.tile_registers && (options.tile_reg_rows == 0 || options.tile_reg_cols == 0) {
            return Err(SessionError::InvalidOption(
                "tile register dimensions must be positive".to_owned(),
            ));
        }
        let working_dir = std::env::current_dir()?
            .try_into()
            .map_err(|e| SessionError::InvalidOption(format!("non-UTF-8 working dir: {e}")))?;
        Ok(Self {
            options,
            working_dir,
        })
    }

    /// Creates a session with default options.
    ///
    /// # Errors
    ///
    /// See [`Session::new`].
    pub fn with_defaults() -> Result<Self, SessionError> {
        Self::new(Options::default())
    }

    /// The session's working directory.
    #[must_use]
    pub fn working_dir(&self) -> &Utf8PathBuf {
        &self.working_dir
    }
}
