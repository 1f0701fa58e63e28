use structopt::StructOpt;

use fleetlog::cli::agent::{main_with_cli, Cli};

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    main_with_cli(Cli::from_args()).await
}
