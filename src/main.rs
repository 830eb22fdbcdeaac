use clap::Parser;
use env_logger::Env;

use quote_gate::app::{bootstrap, cli::Cli};

#[tokio::main]
async fn main() -> quote_gate::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    bootstrap::run(cli).await
}
