//! Stratus CLI — declarative cloud resource reconciliation.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "stratus",
    version,
    about = "Declarative cloud resource reconciliation — typed graphs, plan/apply, BLAKE3 state"
)]
struct Cli {
    #[command(subcommand)]
    command: stratus::cli::Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match stratus::cli::dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    };
    std::process::exit(code);
}
