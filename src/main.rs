use std::sync::Arc;

use groupcall_sfu::api::sfu_routes;
use groupcall_sfu::config::Config;
use groupcall_sfu::media::mediasoup::MediasoupEngine;
use groupcall_sfu::recording::GstLauncher;
use groupcall_sfu::sfu::SfuServer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("groupcall_sfu=info,warp=warn,mediasoup=warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    let engine = match MediasoupEngine::start(&config.media).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!(error = %e, "Failed to start media engine");
            std::process::exit(1);
        }
    };

    let launcher = Arc::new(GstLauncher::from_config(&config.recording));
    let server = SfuServer::new(engine, launcher, config.recording.clone());

    if let Err(e) = server
        .start_injected_source(config.media.listen_ip, &config.injection)
        .await
    {
        tracing::error!(error = %e, "Failed to start injected media source");
    }

    let bind_address = config.bind_address();
    let (addr, serving) = warp::serve(sfu_routes::routes(server.clone()))
        .bind_with_graceful_shutdown(bind_address, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        });

    tracing::info!(address = %addr, "Group call server listening");
    serving.await;

    tracing::info!("Shutting down");
    server.shutdown().await;
}
