// blerelay-cli — BLE MITM relay command line
//
// Connects to a target peripheral, captures its GATT tree, and relays it.
// Hosts without a peripheral-role backend degrade to passive logging of the
// target's services and notifications.

mod central;

use anyhow::{Context, Result};
use blerelay_core::{
    connect_with_retry, CentralDriver, MirrorPolicy, RetryPolicy, SessionConfig,
    SessionController, SessionOutcome, SessionRegistry, StaticCapability,
};
use central::BtleplugCentral;
use clap::Parser;
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "blerelay")]
#[command(about = "BLE man-in-the-middle relay", long_about = None)]
#[command(version)]
struct Cli {
    /// BLE address of the target peripheral (platform id accepted on hosts
    /// that hide addresses)
    target: String,

    /// Maximum connection attempts before giving up
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Delay between connection attempts in milliseconds
    #[arg(long, default_value = "2000")]
    retry_delay_ms: u64,

    /// Use a fixed retry delay instead of exponential backoff
    #[arg(long)]
    fixed_delay: bool,

    /// Mirror only the first discovered service
    #[arg(long)]
    first_service_only: bool,

    /// Local name to advertise on the mirrored peripheral
    #[arg(long, default_value = "blerelay")]
    local_name: String,

    /// Dump the target's service tree as JSON and exit
    #[arg(long)]
    dump_services: bool,
}

impl Cli {
    fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.retry_delay_ms);
        if self.fixed_delay {
            RetryPolicy::fixed(self.max_attempts, delay)
        } else {
            RetryPolicy::exponential(self.max_attempts, delay)
        }
    }

    fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(self.target.clone());
        config.retry = self.retry_policy();
        config.local_name = self.local_name.clone();
        if self.first_service_only {
            config.mirror_policy = MirrorPolicy::FirstServiceOnly;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Usage errors (and --help/--version) go to stdout
    let cli = Cli::try_parse().unwrap_or_else(|err| {
        print!("{err}");
        std::process::exit(err.exit_code());
    });

    let central = Arc::new(
        BtleplugCentral::new()
            .await
            .context("Failed to open Bluetooth adapter")?,
    );

    if cli.dump_services {
        return dump_services(central, &cli).await;
    }

    run_session(central, &cli).await
}

async fn run_session(central: Arc<BtleplugCentral>, cli: &Cli) -> Result<()> {
    // No peripheral-role backend ships for desktop hosts yet, so every real
    // run takes the passive-logging path. The controller still exercises the
    // full capability check.
    let capability = Arc::new(StaticCapability::central_only());
    let registry = SessionRegistry::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{}", "Stopping relay...".yellow());
            let _ = shutdown_tx.send(true);
        }
    });

    println!(
        "{} {}",
        "Relaying target".cyan().bold(),
        cli.target.white()
    );

    let mut controller =
        SessionController::new(central, None, capability, cli.session_config());

    match controller.run(&registry, shutdown_rx).await {
        Ok(SessionOutcome::Relayed) => {
            println!("{}", "Relay session ended".green());
            Ok(())
        }
        Ok(SessionOutcome::Passive) => {
            println!("{}", "Passive logging session ended".green());
            Ok(())
        }
        Err(err) => {
            eprintln!("{} {}", "Session failed:".red().bold(), err);
            std::process::exit(1);
        }
    }
}

async fn dump_services(central: Arc<BtleplugCentral>, cli: &Cli) -> Result<()> {
    println!(
        "{} {}",
        "Inspecting target".cyan().bold(),
        cli.target.white()
    );

    let _events = connect_with_retry(&*central, &cli.target, &cli.retry_policy())
        .await
        .context("Failed to connect to target")?;

    let services = central
        .discover_services()
        .await
        .context("Service discovery failed")?;
    println!("{}", serde_json::to_string_pretty(&services)?);

    if let Err(err) = central.disconnect().await {
        eprintln!("{} {}", "Disconnect failed:".yellow(), err);
    }
    Ok(())
}
