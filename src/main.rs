// btc-peer command line

mod cli;

use clap::Parser;
use cli::{Cli, CliHandler};

#[tokio::main]
async fn main() {
    btc_peer::logging::init();

    let cli = Cli::parse();

    let handler = match CliHandler::new(&cli.network, &cli.wallet) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Error initializing: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = handler.handle(cli.command).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
