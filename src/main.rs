//! Command-line batch retrieval.
//!
//! ```text
//! swdr_retrieval cfg=config.txt ip=/data/in op=/data/out
//! swdr_retrieval --cfg config.txt --ip /data/in --op /data/out
//! ```

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use swdr_retrieval::batch::run_batch;
use swdr_retrieval::config::RetrievalConfig;
use swdr_retrieval::lut::{LutLayout, LutTable};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Surface shortwave, PAR and UV radiation retrieval by LUT inversion"
)]
struct Args {
    #[arg(long, value_name = "PATH", help = "Retrieval configuration file")]
    cfg: PathBuf,

    #[arg(long, value_name = "DIR", help = "Directory of input .tif scenes")]
    ip: PathBuf,

    #[arg(long, value_name = "DIR", help = "Output directory, created if missing")]
    op: PathBuf,
}

/// Rewrite legacy `key=value` tokens into `--key value`.
fn normalize_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out = Vec::new();
    for (i, arg) in args.into_iter().enumerate() {
        match arg.split_once('=') {
            Some((key, value)) if i > 0 && !arg.starts_with('-') && matches!(key, "cfg" | "ip" | "op") => {
                out.push(format!("--{key}"));
                out.push(value.to_string());
            }
            _ => out.push(arg),
        }
    }
    out
}

fn run(args: Args) -> Result<()> {
    if !args.cfg.is_file() {
        bail!("config file {} does not exist", args.cfg.display());
    }
    if !args.ip.is_dir() {
        bail!("input directory {} does not exist", args.ip.display());
    }
    fs::create_dir_all(&args.op)
        .with_context(|| format!("cannot create output directory {}", args.op.display()))?;

    let config = RetrievalConfig::from_file(&args.cfg).context("loading configuration")?;
    config.log_summary();

    let layout = LutLayout::from_config(&config);
    let lut = LutTable::load(&config.lut_file, layout).context("loading LUT")?;

    let summary = run_batch(&args.ip, &args.op, &lut, &config).context("running batch")?;
    info!("{} scenes written to {}", summary.processed, args.op.display());
    Ok(())
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse_from(normalize_args(std::env::args()));
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}
