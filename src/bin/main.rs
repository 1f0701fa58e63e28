use structopt::StructOpt;

#[derive(Debug, StructOpt)]
pub enum Cli {
    Agent(fleetlog::cli::agent::Cli),
    Host(fleetlog::cli::host::Cli),
}

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    use Cli::{Agent, Host};
    match Cli::from_args() {
        Agent(cli) => fleetlog::cli::agent::main_with_cli(cli).await,
        Host(cli) => fleetlog::cli::host::main_with_cli(cli).await,
    }
}
