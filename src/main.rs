use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use tuya2mqtt::config::Config;
use tuya2mqtt::error::{Result, TuyaError};
use tuya2mqtt::mqtt::MqttMessenger;
use tuya2mqtt::registry::DeviceRegistry;
use tuya2mqtt::supervisor::maximize_fd_limit;
use tuya2mqtt::transport::TcpConnector;
use tuya2mqtt::{Bridge, VERSION};

/// Bridge Tuya local-protocol devices to MQTT.
#[derive(Parser, Debug)]
#[command(name = "tuya2mqtt", version = VERSION)]
struct Args {
    /// Broker and bridge configuration
    #[arg(short = 'c', long, default_value = "mqtt.toml")]
    config: PathBuf,

    /// Device list
    #[arg(short = 'D', long, default_value = "devices.json")]
    devices: PathBuf,

    /// Detach from the terminal and run in the background
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Double-fork into the background.
///
/// Must run before the Tokio runtime exists: `fork()` only carries the
/// calling thread into the child.
#[allow(unsafe_code)]
fn daemonize() -> Result<()> {
    #[cfg(unix)]
    {
        use nix::unistd::{ForkResult, fork, setsid};

        let fork_err = |e: nix::Error| TuyaError::Io(format!("fork failed: {}", e));

        // SAFETY: no other thread has been started yet
        match unsafe { fork() }.map_err(fork_err)? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }

        setsid().map_err(|e| TuyaError::Io(format!("setsid failed: {}", e)))?;

        // SAFETY: still single-threaded in the first child
        match unsafe { fork() }.map_err(fork_err)? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }

        std::env::set_current_dir("/")?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        Err(TuyaError::Config(
            "daemon mode is not supported on this platform".into(),
        ))
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run(config: Config, registry: DeviceRegistry) -> Result<()> {
    if let Err(e) = maximize_fd_limit() {
        error!("{}", e);
    }

    let (messenger, inbound) = MqttMessenger::connect(&config.mqtt);
    let bridge = Bridge::start(
        registry,
        TcpConnector::default(),
        config.bridge.session_options(),
        config.bridge_options(),
        messenger,
        inbound,
    )
    .await?;
    info!(
        "Bridging {} devices to {}:{}",
        bridge.supervisor().len(),
        config.mqtt.hostname,
        config.mqtt.port
    );

    wait_for_shutdown().await;
    bridge.shutdown(config.bridge.shutdown_window()).await;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    // Paths are resolved before daemonizing changes the working directory
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let registry = match DeviceRegistry::load(&args.devices) {
        Ok(registry) => registry,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if registry.is_empty() {
        error!("No devices configured in {}", args.devices.display());
        return ExitCode::FAILURE;
    }

    if args.daemon {
        if let Err(e) = daemonize() {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, registry)) {
        Ok(()) => {
            info!("Stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
