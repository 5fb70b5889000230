use anyhow::Result;
use clap::Parser;
use lens_client::{bootstrap::init_tracing, cli, ClientConfig, LensClient};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = cli::Cli::parse();

    let mut config = ClientConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    let client = LensClient::new(config)?;
    let _janitor = client.spawn_janitor();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    cli::execute(&client, &cli.command, &mut out).await
}
