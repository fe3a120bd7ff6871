use declarative_gateway::gateway::server;
use declarative_gateway::observability::logging;
use declarative_gateway::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let settings = Settings::from_env()?;
    settings.log();

    server::run(settings).await?;
    Ok(())
}
