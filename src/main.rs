use actix_web::{web, App, HttpServer};
use log::{error, info, warn};
use tokio::sync::watch;

use symbol_source::app_state::AppState;
use symbol_source::config::AppConfig;
use symbol_source::processor::MessageProcessor;
use symbol_source::service;

fn init_logging(config_file: &str) {
    if let Err(e) = log4rs::init_file(config_file, Default::default()) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        warn!("Could not load log configuration {}: {}. Logging to stderr.", config_file, e);
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = AppConfig::load().map_err(|e| std::io::Error::other(e.to_string()))?;
    init_logging(&config.logging.config_file);

    let state = AppState::from_config(config).map_err(|e| {
        error!("Failed to initialize application state: {}", e);
        std::io::Error::other(e.to_string())
    })?;
    let server_config = state.config.server.clone();

    let (stop, shutdown) = watch::channel(false);
    let listener = {
        let scheduler = state.scheduler.clone();
        let processor: std::sync::Arc<dyn MessageProcessor> = state.processor.clone();
        tokio::spawn(async move { scheduler.listen_and_process(processor, shutdown).await })
    };

    info!("Starting server on {}:{}", server_config.host, server_config.port);
    let data = web::Data::new(state);
    let max_payload_size = server_config.max_payload_size;
    let result = HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(data.clone())
            .app_data(web::PayloadConfig::default().limit(max_payload_size))
            .configure(service::configure)
    })
    .workers(server_config.workers.max(1))
    .bind((server_config.host.as_str(), server_config.port))?
    .run()
    .await;

    info!("Server stopped, waiting for the scheduler");
    let _ = stop.send(true);
    match listener.await {
        Ok(Err(e)) => error!("Scheduler stopped with an error: {}", e),
        Err(e) => error!("Scheduler task failed: {}", e),
        Ok(Ok(())) => {}
    }

    result
}
