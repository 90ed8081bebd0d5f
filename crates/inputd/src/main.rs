//! Guest-input daemon entry point.
//!
//! Wires the infrastructure adapters to the engine and starts the Tokio
//! runtime.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load AppConfig            -- TOML under $XDG_CONFIG_HOME/guest-input
//!  └─ Engine::new()             -- routing state, one task, one inbox
//!  └─ start services
//!       ├─ DeviceScanner        -- /dev/input polling + blocking readers
//!       └─ Engine::run()        -- Tokio task
//!  └─ ctrl-c → EngineMsg::Shutdown
//! ```

use tracing::info;
use tracing_subscriber::EnvFilter;

use inputd::application::engine::{Engine, EngineMsg, EnginePorts};
use inputd::infrastructure::devices::evdev::EvdevSource;
use inputd::infrastructure::devices::leds::{shared_keyboards, DeviceLedSink};
use inputd::infrastructure::devices::scanner::DeviceScanner;
use inputd::infrastructure::storage::config;
use inputd::infrastructure::storage::settings::FileSettingsStore;
use inputd::infrastructure::transport::notifiers::{AckDisplay, LoggingCredentials, LoggingWaker};
use inputd::infrastructure::transport::socket::{UnixSocketTransport, DEFAULT_SOCKET_PATH};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = config::load_config()?;

    // Structured logging; `RUST_LOG` overrides the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&app_config.daemon.log_level)),
        )
        .init();

    info!("guest-input daemon starting");

    let keyboards = shared_keyboards();
    let ports = EnginePorts {
        transport: Box::new(UnixSocketTransport::new(DEFAULT_SOCKET_PATH)),
        display: Box::new(AckDisplay),
        credentials: Box::new(LoggingCredentials),
        leds: Box::new(DeviceLedSink::new(EvdevSource::new(), keyboards.clone())),
        waker: Box::new(LoggingWaker),
        settings: Box::new(FileSettingsStore::new(
            config::config_file_path()?,
            app_config.clone(),
        )),
    };

    let (engine, tx) = Engine::new(app_config.engine_config(), ports);
    let engine_task = tokio::spawn(engine.run());

    let scanner = DeviceScanner::new(
        Box::new(EvdevSource::new()),
        tx.clone(),
        app_config.touchpad.to_pipeline_config(),
        keyboards,
    );
    tokio::spawn(scanner.run());

    info!("guest-input daemon ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = tx.send(EngineMsg::Shutdown).await;
    engine_task.await?;

    info!("guest-input daemon stopped");
    Ok(())
}
