mod bluetooth;
mod config;
mod models;
mod scheduler;
mod upload;
mod utils;

use std::sync::Arc;

use log::{error, info};

use bluetooth::BluezAdapter;
use config::GatewayConfig;
use scheduler::Scheduler;
use upload::{create_http_client, UploadClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match GatewayConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let http = match create_http_client(config.ca_cert_path.as_deref(), config.step_timeout) {
        Ok(http) => http,
        Err(e) => {
            error!("Failed to set up uploads: {}", e);
            return Err(e.into());
        }
    };
    let uploader = UploadClient::new(http, config.upload_url.clone());

    let adapter = match BluezAdapter::new().await {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("Bluetooth unavailable: {}", e);
            return Err(e.into());
        }
    };
    info!("Using Bluetooth adapter {}", adapter.name());

    // Handle Ctrl+C gracefully
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        let _ = tx.send(());
    });

    let mut scheduler = Scheduler::new(
        Arc::new(adapter),
        &config.ble_local_name,
        config.step_timeout,
        config.upload_interval,
        uploader,
        config.keys.clone(),
    );

    // A dropped sender (no signal handler) never ends the loop
    let shutdown = async move {
        if rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    match scheduler.run(shutdown).await {
        Ok(()) => {
            info!("Program terminated by user. Exiting gracefully.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {}", e);
            Err(e.into())
        }
    }
}
