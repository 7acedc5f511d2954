//! # TTC driver
//!
//! The per-module pipeline. For each function:
//!
//! 1. run the tensor property analysis;
//! 2. in knob-print mode, enumerate the legal knob space, write it, and
//!    stop (no rewriting);
//! 3. otherwise allocate and seed the tensor buffers, lower every
//!    tensor intrinsic into its tiled loop nest, and erase the
//!    intrinsics and `typeinfo` annotations;
//! 4. re-verify the function.
//!
//! There is no partial failure: either the whole function lowers and
//! verifies, or compilation aborts with a diagnostic naming the
//! offending SSA value and the violated invariant. Re-running the
//! pipeline on lowered IR is a no-op (no tensor intrinsics remain, so
//! the analysis finds nothing to do).

#![warn(missing_docs)]
#![warn(clippy::all)]

use tracing::{debug, info};
use ttc_ir::Module;
use ttc_lower::engine::{collect_intrinsics, knob_spaces};
use ttc_lower::{lower_function, KnobSet, LowerConfig};
use ttc_session::{KnobMode, Options};
use ttc_tensor::{allocate_buffers, TensorAnalysis};

/// Driver failures; each wraps the failing stage's diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The tensor property analysis failed.
    #[error("tensor analysis: {0}")]
    Analysis(#[from] ttc_tensor::AnalysisError),

    /// Lowering failed.
    #[error("lowering: {0}")]
    Lower(#[from] ttc_lower::LowerError),

    /// The lowered module is ill-formed (an engine bug).
    #[error("post-lowering verification: {0}")]
    Verify(#[from] ttc_ir::VerifyError),

    /// A knob file could not be read or written.
    #[error(transparent)]
    Knob(#[from] ttc_lower::KnobError),
}

/// The engine configuration derived from session options.
#[must_use]
pub fn lower_config(options: &Options) -> LowerConfig {
    LowerConfig {
        tile_size: options.tile_size,
        tile_size_m: options.tile_size_m,
        tile_size_n: options.tile_size_n,
        tile_size_k: options.tile_size_k,
        inner_loop_unroll_factor: options.inner_loop_unroll_factor,
        register_bits: options.register_bits,
        tile_registers: options.tile_registers,
        tile_reg_rows: options.tile_reg_rows,
        tile_reg_cols: options.tile_reg_cols,
    }
}

/// Runs the pipeline over every function of `module`.
///
/// # Errors
///
/// The first fatal diagnostic; the module may be partially rewritten
/// and must be discarded on error.
pub fn run(module: &mut Module, options: &Options) -> Result<(), DriverError> {
    let knobs = match &options.knob_mode {
        KnobMode::Read(path) => KnobSet::read_from(path.as_std_path())?,
        _ => KnobSet::empty(),
    };
    let config = lower_config(options);

    for func in module.funcs.iter_mut() {
        let name = func.name.as_str().to_owned();
        debug!(func = %name, "analyzing tensor properties");
        let mut analysis = TensorAnalysis::analyze(func)?;

        if let KnobMode::Print(path) = &options.knob_mode {
            let collected = collect_intrinsics(func);
            let spaces = knob_spaces(func, &analysis, &collected);
            info!(func = %name, knobs = spaces.len(), "printing knob schema");
            ttc_lower::knobs::print_knobs_to(path.as_std_path(), &name, &spaces)?;
            continue;
        }

        debug!(func = %name, tensors = analysis.tensor_values().len(), "allocating buffers");
        allocate_buffers(func, &mut analysis, options.init_with_memcpy);

        lower_function(func, &mut analysis, &config, &knobs)?;
        ttc_ir::verify_function(func)?;

        if options.dump_ir {
            info!(func = %name, "lowered:\n{}", func);
        }
    }
    Ok(())
}
