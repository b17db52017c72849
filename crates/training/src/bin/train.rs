use std::path::PathBuf;

use clap::Parser;
use segmentation_training::util::{init_tracing, run_train, TrainArgs};
use segmentation_training::CONFIG_ENV;

fn main() -> anyhow::Result<()> {
    init_tracing();
    let mut args = TrainArgs::parse();
    if args.config.is_none() {
        args.config = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    }
    run_train(args)
}
