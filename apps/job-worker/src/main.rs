//! # Verdant Job Worker
//!
//! Runs the background job queue and a small HTTP surface for monitoring
//! and cancelling jobs.

use actix_web::{App, HttpServer, web};
use tracing_actix_web::TracingLogger;

#[cfg(feature = "scheduler")]
mod background;
mod config;
mod handlers;
mod middleware;
mod processors;
mod state;
mod telemetry;

use config::AppConfig;
use state::AppState;
use telemetry::{TelemetryConfig, init_telemetry};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_telemetry(&TelemetryConfig::from_env());

    let config = AppConfig::from_env();

    tracing::info!(
        "Starting Verdant job worker on {}:{}",
        config.host,
        config.port
    );

    // Connects the brokers, or falls back to inline execution
    let state = AppState::new(&config).await;
    let jobs = state.jobs.clone();

    #[cfg(feature = "scheduler")]
    let mut heartbeat =
        match background::start_stats_heartbeat(config.scheduler.clone(), jobs.clone()).await {
            Ok(scheduler) => scheduler,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start stats heartbeat");
                None
            }
        };

    // Runs until Ctrl-C / SIGTERM
    let served = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(handlers::configure_routes)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await;

    #[cfg(feature = "scheduler")]
    {
        if let Some(scheduler) = heartbeat.as_mut() {
            if let Err(e) = scheduler.shutdown().await {
                tracing::warn!(error = %e, "Failed to stop stats heartbeat");
            }
        }
    }

    jobs.shutdown().await;
    tracing::info!("Job worker stopped");

    served
}
