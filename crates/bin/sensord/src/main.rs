//! # sensord: sensor middleware daemon
//!
//! Composition root that wires all adapters together and runs until told to
//! stop.
//!
//! ## Responsibilities
//! - Parse configuration (CLI args, env vars, config file)
//! - Bind the control socket, refusing to start when another daemon owns it
//! - Connect the configured MQTT brokers and WebSocket endpoints
//! - Register every configured sensor with its sink bindings
//! - Serve control requests until SIGTERM/SIGINT, then shut down in order
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer; no domain logic belongs here.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sensord_adapter_ipc::IpcServer;
use sensord_adapter_mqtt::BrokerRegistry;
use sensord_adapter_serial::SerialOpener;
use sensord_adapter_ws::EndpointRegistry;
use sensord_app::control::ControlService;
use sensord_app::dispatcher::{EventDispatcher, SinkHandle};
use sensord_app::registry::SensorRegistry;
use sensord_domain::sensor::SensorConfig;
use sensord_domain::sink::SinkBinding;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "sensord", version, about = "Sensor middleware daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "SENSORD_CONFIG", default_value = "sensord.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("unable to load {}", args.config.display()))?;

    let filter = EnvFilter::try_new(&config.logging.filter)
        .with_context(|| format!("invalid log filter {:?}", config.logging.filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!(config = %args.config.display(), "sensord starting");

    // Control socket first: a second daemon must not touch the ports.
    let server = IpcServer::bind(&config.api.socket_path)
        .await
        .context("unable to bind control socket")?;

    // Outputs
    let dispatcher = Arc::new(EventDispatcher::new(config.dispatcher_settings()));
    let brokers = BrokerRegistry::connect(&config.mqtt.broker);
    let endpoints = EndpointRegistry::connect(&config.ws.endpoint);

    // Sensors
    let registry = Arc::new(SensorRegistry::new(
        SerialOpener::default(),
        Arc::clone(&dispatcher),
    ));
    for sensor in config.sensor_configs() {
        let id = sensor.id();
        let sinks = bind_sinks(&sensor, &dispatcher, &brokers, &endpoints);
        if let Err(err) = registry.register(sensor, sinks).await {
            tracing::warn!(sensor = %id, %err, "sensor not registered");
        }
    }

    // Control API
    let service = Arc::new(ControlService::new(
        Arc::clone(&registry),
        Arc::clone(&dispatcher),
    ));
    server.serve(service, shutdown_signal()).await;

    registry.shutdown().await;
    dispatcher.shutdown().await;
    brokers.shutdown().await;
    endpoints.shutdown().await;
    tracing::info!("sensord stopped");
    Ok(())
}

/// Start one sink worker per binding. Bindings naming an unknown or
/// disabled output are skipped.
fn bind_sinks(
    sensor: &SensorConfig,
    dispatcher: &EventDispatcher,
    brokers: &BrokerRegistry,
    endpoints: &EndpointRegistry,
) -> Vec<SinkHandle> {
    sensor
        .sinks
        .iter()
        .filter_map(|binding| {
            let bound = match binding {
                SinkBinding::Mqtt { broker, topic } => brokers
                    .sink(broker, topic)
                    .map(|sink| dispatcher.spawn_sink(sink))
                    .map_err(|err| err.to_string()),
                SinkBinding::WebSocket { endpoint } => endpoints
                    .sink(endpoint)
                    .map(|sink| dispatcher.spawn_sink(sink))
                    .map_err(|err| err.to_string()),
            };
            match bound {
                Ok(handle) => Some(handle),
                Err(err) => {
                    tracing::warn!(sensor = %sensor.id(), %binding, %err, "sink binding skipped");
                    None
                }
            }
        })
        .collect()
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "unable to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
    tracing::info!("shutdown requested");
}
