use std::path::PathBuf;

use clap::Parser;
use segmentation_training::util::init_tracing;
use segmentation_training::{run_eval, EvalArgs, CONFIG_ENV};

fn main() -> anyhow::Result<()> {
    init_tracing();
    let mut args = EvalArgs::parse();
    if args.config.is_none() {
        args.config = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    }
    run_eval(args)?;
    Ok(())
}
