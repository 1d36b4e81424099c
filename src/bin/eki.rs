//! EKI command line client
//!
//! Connects to the EKI server program on the controller, bootstraps the
//! session and runs one subcommand. Results go to stdout as JSON lines,
//! logs go to stderr.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eki::config::DEFAULT_CONFIG_PATH;
use eki::json_output::{output_event, MotionEvent, StateEvent};
use eki::stream::{parse_joint_list, CommandStream};
use eki::{DriverConfig, EkiDriver, MotionOutcome};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eki")]
#[command(about = "Control and monitor an EKI-connected robot arm")]
#[command(version)]
struct Args {
    /// Path to the driver configuration file
    #[arg(short, long, global = true, env = "EKI_CONFIG_PATH")]
    config: Option<String>,

    /// Controller address, overrides the configuration file
    #[arg(long, global = true)]
    host: Option<String>,

    /// EKI port, overrides the configuration file
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Require the remote program to be running before any motion
    #[arg(long, global = true)]
    safe_mode: bool,

    /// Show debug output including raw protocol traffic
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print identity, limits and current telemetry
    Status,
    /// Move to joint positions in degrees, e.g. `move 0 -90 90 0 0 0`
    Move {
        #[arg(required = true, allow_negative_numbers = true, num_args = 1..)]
        joints: Vec<String>,
    },
    /// Stop the current motion
    Stop,
    /// Send a raw EKI command line
    Send {
        command: String,
    },
    /// Print state snapshots until interrupted
    Watch {
        /// Milliseconds between snapshots
        #[arg(short, long, default_value = "500")]
        interval_ms: u64,
    },
    /// Read commands from stdin, one per line
    Stream,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    fn load_config(&self) -> Result<DriverConfig> {
        let config_path = self.get_config_path();

        let mut config = match DriverConfig::load_from_path(&config_path) {
            Ok(config) => {
                info!("Using config: {}", config_path);
                config
            }
            Err(e) => match &self.host {
                // A host on the command line is enough to run with defaults
                Some(host) => {
                    info!("No usable config at {} ({}), using defaults", config_path, e);
                    DriverConfig::for_host(host)
                }
                None => {
                    return Err(e).with_context(|| format!("Failed to load config from {}", config_path))
                }
            },
        };

        if let Some(host) = &self.host {
            config.device.host = host.clone();
        }
        if let Some(port) = self.port {
            config.device.port = Some(port);
        }
        if self.safe_mode {
            config.motion.safe_mode = Some(true);
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "eki=debug" } else { "eki=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = args.load_config()?;
    let decimal_places = config.motion.decimal_places();

    info!("EKI client");
    info!("{}", "=".repeat(50));

    let mut driver = EkiDriver::new(config).context("Failed to create driver")?;
    if let Err(e) = driver.connect().await {
        error!("Session setup failed: {}", e);
        error!("Make sure:");
        error!("   - The EKI server program is selected and running on the controller");
        error!("   - The controller is reachable on the configured address and port");
        return Err(e).context("Failed to connect to robot");
    }

    match args.command {
        Commands::Status => {
            output_event(
                &StateEvent::from_state(&driver.snapshot(), decimal_places).with_traffic(driver.stats()),
            );
            driver.close().await.context("Failed to close session")?;
        }
        Commands::Move { joints } => {
            let target = parse_joint_list(&joints.join(" ")).map_err(anyhow::Error::msg)?;
            output_event(&MotionEvent::started(&target));

            let result = driver.move_to_joint_positions(&target).await;
            driver.close().await.context("Failed to close session")?;
            match result {
                Ok(outcome) => {
                    output_event(&MotionEvent::finished(&target, outcome));
                    if outcome == MotionOutcome::TimedOut {
                        bail!("Motion did not complete in time");
                    }
                }
                Err(e) => {
                    output_event(&MotionEvent::error(&target, &e));
                    return Err(e).context("Motion failed");
                }
            }
        }
        Commands::Stop => {
            driver.stop().await.context("Failed to stop robot")?;
            driver.close().await.context("Failed to close session")?;
        }
        Commands::Send { command } => {
            driver.send_raw(&command).await.context("Failed to send command")?;
            driver.close().await.context("Failed to close session")?;
        }
        Commands::Watch { interval_ms } => {
            run_watch(&driver, Duration::from_millis(interval_ms), decimal_places).await;
            driver.close().await.context("Failed to close session")?;
        }
        Commands::Stream => {
            let shutdown_signal = Arc::new(AtomicBool::new(false));
            let mut stream = CommandStream::new(driver, shutdown_signal);
            stream
                .run(BufReader::new(tokio::io::stdin()))
                .await
                .context("Command stream failed")?;

            info!("Performing graceful shutdown");
            stream.shutdown().await.context("Failed during shutdown")?;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn run_watch(driver: &EkiDriver, interval: Duration, decimal_places: u32) {
    info!("Watching robot state, press Ctrl+C to stop");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = driver.update_state().await {
                    error!("Telemetry refresh failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                output_event(&StateEvent::from_state(&driver.snapshot(), decimal_places));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }
}
