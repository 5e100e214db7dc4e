use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = speedtest_cli::cli::Cli::parse();
    speedtest_cli::cli::run(args).await
}
