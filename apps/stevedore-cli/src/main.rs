mod cli;

use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    let exit_code = cli.run().await;
    std::process::exit(exit_code);
}
