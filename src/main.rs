use clap::Parser;
use skymargin::cli::{run_command, Cli};
use tracing::{debug, error};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(cli.verbose >= 2)
        .init();

    debug!("skymargin started with verbosity level: {}", cli.verbose);

    if let Err(e) = run_command(cli.command).await {
        error!("Fatal error: {}", e);
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
