use std::error::Error;

use sentiment_core::Settings;
use tracing::{error, info};

mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // the level comes from the settings, so they are loaded before tracing is up
    let settings = Settings::load();
    let log_level = settings
        .as_ref()
        .map_or("info", |settings| settings.log_level.as_str());
    setup_tracing::register(log_level);

    let settings = settings.inspect_err(|e| error!(?e, "Invalid configuration"))?;

    info!("Starting the sentiment stream processor");
    if let Err(e) = sentiment_core::run(settings).await {
        error!("{e:?}");
        return Err(e.into());
    }
    info!("Exiting...");

    Ok(())
}
