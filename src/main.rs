use color_eyre::{eyre::eyre, Result};
use padbridge::bridge::replay::{ReplayReport, ReplayTrace};
use padbridge::bridge::BridgeHandle;
use padbridge::config::{BridgeConfig, LoggingConfig};
use padbridge::platform::{ChannelPlatform, PlatformEvent};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::FmtSubscriber;

/// Overrides the config file location.
const CONFIG_ENV: &str = "PADBRIDGE_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    let config = BridgeConfig::load(config_path.as_deref()).await?;
    setup_logging_env(&config.logging);
    info!("Starting padbridge with {:?}", config.bluetooth);

    let trace = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => ReplayTrace::load(&path).await?,
        None => {
            info!("No trace given, replaying an empty trace");
            ReplayTrace::default()
        }
    };

    let (platform_tx, mut platform_rx) = mpsc::channel(config.runtime.platform_queue_capacity.max(1));
    let handle = BridgeHandle::spawn(trace.stack(), ChannelPlatform::new(platform_tx), &config)
        .map_err(|e| eyre!("Failed to spawn bridge: {}", e))?;

    let platform_logger = tokio::spawn(async move {
        while let Some(event) = platform_rx.recv().await {
            log_platform_event(&event);
        }
        debug!("Platform channel closed");
    });

    info!("Replaying {} events", trace.events.len());
    for event in trace.events {
        handle.send_event(event).await?;
    }

    let snapshots = handle.close().await?;
    platform_logger
        .await
        .map_err(|e| eyre!("Platform logger failed: {}", e))?;

    info!("{} devices after replay", snapshots.len());
    for device in &snapshots {
        info!(
            "{} '{}' {} family={} vid=0x{:04x} pid=0x{:04x} incoming={}",
            device.address,
            device.name.as_deref().unwrap_or("?"),
            device.state,
            device.family.map_or_else(|| "unknown".to_string(), |f| f.to_string()),
            device.vendor_id,
            device.product_id,
            device.incoming
        );
        info!("  {}", device.gamepad.summary());
    }
    info!("Device report:\n{}", ReplayReport::new(&snapshots).to_toml()?);
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(logging: &LoggingConfig) {
    let builder = FmtSubscriber::builder()
        .with_max_level(logging.max_level())
        .with_target(false)
        .with_thread_ids(logging.thread_ids)
        .with_file(logging.file_and_line)
        .with_line_number(logging.file_and_line);
    if logging.pretty {
        builder.pretty().init();
    } else {
        builder.init();
    }
}

fn log_platform_event(event: &PlatformEvent) {
    match event {
        PlatformEvent::BluetoothReady => info!("Platform: bluetooth ready"),
        PlatformEvent::GamepadReport(report) => info!(
            "Platform: report from {} on port {:?} at {}: {}",
            report.address,
            report.port,
            report.timestamp.format("%H:%M:%S.%3f"),
            report.state.summary()
        ),
        PlatformEvent::PortAssigned { address, port } => {
            info!("Platform: {} assigned to port {}", address, port)
        }
        PlatformEvent::PortReleased { address, port } => {
            info!("Platform: {} released port {}", address, port)
        }
    }
}
