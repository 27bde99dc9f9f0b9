#![forbid(unsafe_code)]

use clap::Parser;
use wax::cli::{Cli, run};

fn main() {
    wax::utils::logger::configure_from_env();
    wax::utils::feature_flags::init_from_env();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
