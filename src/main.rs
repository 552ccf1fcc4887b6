use anyhow::Result;
use clap::Parser;
use finledger::cli::Cli;
use finledger::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);
    cli.run().await
}
