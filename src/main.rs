use clap::Parser;
use trailcam_classifier::cli;

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();

    if let Err(e) = cli::run(args).await {
        // The subscriber may not be up yet (bad config), so also print.
        tracing::error!("{e:#}");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
