use std::path::Path;
use std::sync::Arc;

use overpass_features::{
    api::{create_router, AppState},
    config::{Config, ServerList, TagVocabulary},
    overpass::OverpassClient,
    pipeline::Pipeline,
    region::NominatimGeocoder,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting Overpass features server");

    // Load configuration
    let mut config = Config::from_env();
    if let Ok(path) = std::env::var("OVERPASS_SERVERS_FILE") {
        config = config.with_servers(ServerList::load(Path::new(&path))?);
    }
    config.validate()?;

    info!("Configuration loaded: {:?}", config);

    let vocabulary = match std::env::var("OVERPASS_VOCABULARY") {
        Ok(path) => Some(TagVocabulary::load(Path::new(&path))?),
        Err(_) => None,
    };

    let pipeline = Pipeline::new(
        Arc::new(NominatimGeocoder::new(config.geocoder.clone())?),
        Arc::new(OverpassClient::new(&config.overpass)?),
        config.output.clone(),
    );

    let app = create_router(AppState {
        pipeline,
        config: config.clone(),
        vocabulary,
    });

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))
            .await?;

    info!(
        "Server listening on {}:{}",
        config.server.host, config.server.port
    );
    info!(
        "Health check: http://{}:{}/api/health",
        config.server.host, config.server.port
    );

    axum::serve(listener, app).await?;

    Ok(())
}
