//! Tiled Tensor Compiler (TTC) - Main Entry Point
//!
//! Rewrites tensor intrinsics in serialized SSA modules into explicit
//! tiled loop nests.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use ttc_session::{KnobMode, Options, Session};

/// Tiled Tensor Compiler - tensor intrinsic lowering for SSA modules
#[derive(Parser, Debug)]
#[command(name = "ttc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The command to execute
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Lower the tensor intrinsics of a serialized module
    Lower {
        /// The module to lower (JSON)
        module: Utf8PathBuf,

        /// Output path for the rewritten module
        #[arg(short, long)]
        output: Option<Utf8PathBuf>,

        /// Skip lowering; write the legal knob space to this file
        #[arg(long, value_name = "FILE")]
        print_knobs_to: Option<Utf8PathBuf>,

        /// Read per-instruction knob values from this file
        #[arg(long, value_name = "FILE")]
        read_knobs_from: Option<Utf8PathBuf>,

        /// Seed tensor buffers with typed stores instead of memcpy
        #[arg(long)]
        typed_store_init: bool,

        /// Lower matmul through 2-D tile-register intrinsics
        #[arg(long)]
        tile_registers: bool,

        /// Dump each function after lowering
        #[arg(long)]
        dump_ir: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Lower {
            module,
            output,
            print_knobs_to,
            read_knobs_from,
            typed_store_init,
            tile_registers,
            dump_ir,
        } => {
            let knob_mode = match (print_knobs_to, read_knobs_from) {
                (Some(_), Some(_)) => {
                    anyhow::bail!("--print-knobs-to and --read-knobs-from are mutually exclusive")
                }
                (Some(path), None) => KnobMode::Print(path),
                (None, Some(path)) => KnobMode::Read(path),
                (None, None) => KnobMode::Defaults,
            };
            let options = Options {
                knob_mode,
                init_with_memcpy: !typed_store_init,
                tile_registers,
                dump_ir,
                ..Options::default()
            };
            lower_module(&module, output.as_ref(), options)
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Load, lower, and write back one module.
fn lower_module(path: &Utf8PathBuf, output: Option<&Utf8PathBuf>, options: Options) -> Result<()> {
    let session =
        Session::new(options).map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let mut module: ttc_ir::Module =
        serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;

    tracing::info!(
        "Lowering {} function(s) of module {}",
        module.funcs.len(),
        module.name
    );

    if let Err(e) = ttc_driver::run(&mut module, &session.options) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    // Print mode rewrites nothing; there is no module to write back.
    if matches!(session.options.knob_mode, KnobMode::Print(_)) {
        return Ok(());
    }

    let out_path = output.cloned().unwrap_or_else(|| {
        let mut p = path.clone();
        p.set_extension("lowered.json");
        p
    });
    let json = serde_json::to_string_pretty(&module)?;
    std::fs::write(&out_path, json + "\n").with_context(|| format!("writing {out_path}"))?;
    tracing::info!("Wrote {}", out_path);
    Ok(())
}

/// Print version information
fn print_version() {
    println!("Tiled Tensor Compiler (TTC)");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Lowers tensor intrinsics to tiled loop nests");
}
