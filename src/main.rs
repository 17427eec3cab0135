use cre_listing_crawler::cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // stdout is reserved for command output and --events lines
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::parse_args();
    if let Err(e) = cli::process_command(args).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
