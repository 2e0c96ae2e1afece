use clap::Parser;
use steptrader::cli::{run, Cli};
use tracing_subscriber::fmt;

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let subscriber = fmt()
        .with_max_level(cli.verbosity)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("warning: logging disabled: {e}");
    }

    run(cli)
}
