use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::warn;
use pickler::{Limits, PickleInspector, ScanStatus};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Decode opcodes only; never reconstructs objects.
    Safe,
    /// Reconstruct the object graph and summarize it. Trusted files only.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// Indented JSON.
    Json,
    /// Human-readable report.
    Text,
}

/// Inspect a Python pickle file without trusting it.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Pickle file to inspect.
    path: PathBuf,

    #[arg(long, value_enum, default_value_t = Mode::Safe)]
    mode: Mode,

    /// Deepest container level rendered in full mode.
    #[arg(long, default_value_t = Limits::default().max_depth)]
    max_depth: usize,

    /// Most children kept per container in full mode.
    #[arg(long, default_value_t = Limits::default().max_items)]
    max_items: usize,

    /// Elements shown per numpy array in full mode.
    #[arg(long, default_value_t = Limits::default().array_preview_count)]
    array_preview_count: usize,

    /// Rows shown per DataFrame in full mode.
    #[arg(long, default_value_t = Limits::default().table_preview_rows)]
    table_preview_rows: usize,

    /// Print an opcode listing instead of the safe-mode report.
    #[arg(long, conflicts_with = "mode")]
    disassemble: bool,

    #[arg(long, value_enum, default_value_t = Format::Json)]
    format: Format,
}

impl Args {
    fn limits(&self) -> Limits {
        Limits {
            max_depth: self.max_depth,
            max_items: self.max_items,
            array_preview_count: self.array_preview_count,
            table_preview_rows: self.table_preview_rows,
        }
    }
}

fn main() -> Result<()> {
    // Logs go to stderr so stdout stays parseable.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if args.disassemble {
        let listing = PickleInspector::disassemble(&args.path)
            .with_context(|| format!("cannot read {}", args.path.display()))?;
        println!("{listing}");
        return Ok(());
    }

    match args.mode {
        Mode::Safe => {
            let outcome = PickleInspector::safe_view(&args.path)
                .with_context(|| format!("cannot read {}", args.path.display()))?;
            if let ScanStatus::Stopped { position, reason } = &outcome.status {
                warn!("partial report: stream damaged at byte {position}: {reason}");
            }
            match args.format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&outcome.report)?),
                Format::Text => println!("{outcome}"),
            }
        }
        Mode::Full => {
            warn!("full mode reconstructs the object graph; use it on trusted files only");
            let summary = PickleInspector::full_view(&args.path, &args.limits())
                .with_context(|| format!("cannot reconstruct {}", args.path.display()))?;
            match args.format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                Format::Text => print!("{summary}"),
            }
        }
    }
    Ok(())
}
