pub mod codec;
pub mod config;
pub mod device;
pub mod mqtt;
pub mod ota;
pub mod simulator;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use config::{Capabilities, Cli, SimulatorConfig};
use device::announce::last_will_payload;
use device::log_buffer::LogRingBuffer;
use device::topics::{Channel, TopicSet};
use mqtt::mqtt_handler::{ConnectSpec, MqttHandler};
use mqtt::transport::DryRunTransport;
use rumqttc::LastWill;
use simulator::{RunSummary, Simulator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.verbose)?;

    let config = SimulatorConfig::load(&cli)?;
    let capabilities = config.capabilities();
    info!(
        "Simulating {} (services {:?}, logs {})",
        config.device.id, capabilities.extra_services, capabilities.logs
    );

    let topics = Arc::new(TopicSet::new(&config.device.id, capabilities.logs));
    let log = simulator::device_log(&config.device.id, capabilities.logs);

    let shutdown = CancellationToken::new();
    tokio::spawn(listen_for_shutdown(shutdown.clone()));

    let summary = if config.dry_run {
        info!("Dry run, payloads are logged instead of published");
        let simulator = Simulator::new(
            Arc::new(DryRunTransport),
            &config,
            capabilities,
            topics,
            log,
        );
        simulator.run(None, shutdown).await?
    } else {
        run_connected(&config, capabilities, topics, log, shutdown).await?
    };

    info!(
        "Done: {} telemetry samples, last OTA {:?}",
        summary.telemetry_sent, summary.last_transfer
    );
    Ok(())
}

async fn run_connected(
    config: &SimulatorConfig,
    capabilities: Capabilities,
    topics: Arc<TopicSet>,
    log: Arc<LogRingBuffer>,
    shutdown: CancellationToken,
) -> Result<RunSummary> {
    let last_will = LastWill::new(
        topics.status.clone(),
        last_will_payload(&config.device.firmware)?,
        Channel::Status.qos(),
        Channel::Status.retain(),
    );
    let spec = ConnectSpec {
        client_id: config.client_id(),
        last_will,
    };

    let (inbound_tx, inbound_rx) = mpsc::channel(config.mqtt.request_capacity);
    let (handler, event_loop) = MqttHandler::spawn(
        &config.mqtt,
        spec,
        inbound_tx,
        log.clone(),
        shutdown.clone(),
    );

    let wait = Duration::from_millis(config.mqtt.connect_wait_ms);
    if !handler.wait_connected(wait).await {
        warn!(
            "No CONNACK from {}:{} within {:?} ({:?}), continuing",
            config.mqtt.host,
            config.mqtt.port,
            wait,
            handler.connection_state()
        );
    }

    let handler = Arc::new(handler);
    let simulator = Simulator::new(handler.clone(), config, capabilities, topics, log);
    let result = simulator.run(Some(inbound_rx), shutdown.clone()).await;
    if let Err(e) = &result {
        error!("Simulator stopped: {}", e);
        shutdown.cancel();
    }

    handler.disconnect().await;
    if let Err(e) = event_loop.await {
        warn!("MQTT event loop task failed: {}", e);
    }
    info!("Disconnected");

    result.map_err(|e| eyre!("Simulator failed: {}", e))
}

async fn listen_for_shutdown(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl-C received"),
                    _ = terminate.recv() => debug!("SIGTERM received"),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Ctrl-C handler unavailable: {}", e);
                    return;
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Ctrl-C handler unavailable: {}", e);
            return;
        }
    }
    info!("Interrupted, shutting down");
    shutdown.cancel();
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env(verbose);
    Ok(())
}

fn setup_logging_env(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
