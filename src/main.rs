mod config;
mod error;
mod handlers;
mod inference;
mod models;
mod state;
mod store;

use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use log::{error, info};

use config::{Config, ServerConfig};
use inference::ModelArtifacts;
use state::AppState;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Loads everything the handlers need, then serves until shutdown. Any
/// startup failure ends the process before a socket is bound.
fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    // The blocking Firestore client must be built outside the async runtime.
    let store = store::connect(&config.store).context("Failed to initialize the document store")?;
    let artifacts = ModelArtifacts::load(&config.artifacts).context("Failed to load model files")?;
    info!("Model, encoders, and label mapping loaded successfully");

    // Held here so the last reference, and the blocking client with it, is
    // dropped after the runtime has shut down.
    let state = web::Data::new(AppState::new(artifacts, store));
    actix_rt::System::new()
        .block_on(serve(config.server, state.clone()))
        .context("Server stopped with an error")
}

async fn serve(server: ServerConfig, state: web::Data<AppState>) -> std::io::Result<()> {
    let bind_address = server.bind_address();
    info!("Server running at http://{}", bind_address);

    let mut http = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            .configure(handlers::configure)
    });
    if let Some(workers) = server.workers {
        http = http.workers(workers);
    }

    http.bind(&bind_address)?.run().await
}
