use profstore::app_state::AppState;
use profstore::config::Settings;
use profstore::prelude::*;
use profstore::server::run_server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("Starting profile storage service v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run().await {
        error!("Fatal: {}", e);
        return Err(e);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let settings = Settings::new()?;
    let (app_state, lifecycle) = AppState::from_settings(&settings).await?;

    let served = run_server(app_state, &settings.server, settings.exit_timeout()).await;
    lifecycle.shutdown().await;
    served
}
