use clap::Parser;
use log::info;
use quarzlampe_link::cli::Args;
use quarzlampe_link::{init_logging, run};
use quarzlampe_link::error::{AppRunError, ConfigError};

fn main() -> Result<(), AppRunError> {
    let args = Args::parse();

    init_logging(args.verbose);
    info!(concat!("Quarzlampe Link ", env!("CARGO_PKG_VERSION")));

    match run(args) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("quarzlampe-link is already running");
            Ok(())
        },
        Err(err) => Err(err),
        Ok(_) => Ok(())
    }
}
