use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use loca2_core::config::DEFAULT_BASE_URL;
use loca2_core::{
    ClientConfig, Coordinator, CoordinatorConfig, CoordinatorHandle, Device, Loca2Client,
    TrackerSet,
};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod notifier;
mod render;
#[cfg(test)]
mod render_tests;

use notifier::LogNotifier;
use render::{emit, OutputFormat};

#[derive(Debug, Parser)]
#[command(name = "loca2d")]
#[command(about = "Loca2 device location poller")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    #[arg(long, env = "LOCA2_ACCOUNT")]
    account: String,

    #[arg(long, env = "LOCA2_PASSWORD", hide_env_values = true)]
    password: String,

    /// Poll interval in seconds (10..=300).
    #[arg(long, default_value_t = 30)]
    scan_interval: u64,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Device ids to drop from every fetch.
    #[arg(long = "disable", value_name = "DEVICE_ID")]
    disabled: Vec<String>,

    #[arg(long, value_enum, default_value = "human", global = true)]
    format: OutputFormat,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that the credentials are accepted.
    Login,
    Devices,
    Locate {
        device_id: String,
    },
    /// One coordinator cycle followed by a diagnostic snapshot.
    Once,
    Run,
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let format = cli.format;
    let mut client = Loca2Client::new(client_config(&cli))?;

    match &cli.command {
        Command::Login => {
            let connected = client.test_connection().await;
            let out = serde_json::json!({
                "connected": connected,
                "client": client.diagnostics(),
            });
            emit(&out, format, || {
                format!(
                    "Login {} ({})\n",
                    if connected { "ok" } else { "failed" },
                    client.connection_status()
                )
            })?;
            client.close();
            if !connected {
                bail!("authentication against {} failed", cli.base_url);
            }
        }
        Command::Devices => {
            let devices = client.get_devices().await?;
            let devices: Vec<&Device> = devices
                .iter()
                .filter(|d| !cli.disabled.contains(&d.id))
                .collect();
            emit(&devices, format, || render::human_devices(&devices))?;
            client.close();
        }
        Command::Locate { device_id } => {
            let mut coordinator = coordinator(client, &cli)?;
            let location = coordinator.get_device_location(device_id).await;
            emit(&location, format, || {
                render::human_location(device_id, location.as_ref())
            })?;
            coordinator.close().await;
        }
        Command::Once => {
            let mut coordinator = coordinator(client, &cli)?;
            if let Err(err) = coordinator.refresh().await {
                warn!(error = %err, "update cycle failed");
            }
            let devices = coordinator.devices();
            let devices: Vec<&Device> = devices.values().collect();
            let snapshot = coordinator.get_diagnostic_info();
            let out = serde_json::json!({ "devices": devices, "diagnostics": snapshot });
            emit(&out, format, || {
                render::human_snapshot(&snapshot) + &render::human_devices(&devices)
            })?;
            coordinator.close().await;
        }
        Command::Run => {
            let handle = CoordinatorHandle::new(coordinator(client, &cli)?);
            run_loop(&handle, format).await?;
            handle.lock().await.close().await;
        }
        Command::Health => {
            let mut coordinator = coordinator(client, &cli)?;
            if let Err(err) = coordinator.refresh().await {
                warn!(error = %err, "update cycle failed");
            }
            let report = coordinator.perform_health_check().await;
            emit(&report, format, || render::human_health(&report))?;
            coordinator.close().await;
            if !report.overall_healthy {
                bail!("health check failed");
            }
        }
    }

    Ok(())
}

fn client_config(cli: &Cli) -> ClientConfig {
    ClientConfig {
        base_url: cli.base_url.clone(),
        request_timeout: Duration::from_secs(cli.timeout),
        ..ClientConfig::new(&cli.account, &cli.password)
    }
}

fn coordinator(client: Loca2Client, cli: &Cli) -> Result<Coordinator<Loca2Client>> {
    let config = CoordinatorConfig {
        scan_interval: Duration::from_secs(cli.scan_interval),
        disabled_devices: cli.disabled.iter().cloned().collect(),
        ..CoordinatorConfig::default()
    };
    Ok(Coordinator::new(client, Box::new(LogNotifier), config)?)
}

async fn run_loop(handle: &CoordinatorHandle<Loca2Client>, format: OutputFormat) -> Result<()> {
    let mut trackers = TrackerSet::default();
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            _ = sleep(delay) => {
                match handle.refresh().await {
                    Ok(devices) => trackers.record_cycle(&devices),
                    Err(err) => {
                        warn!(error = %err, "update cycle failed");
                        trackers.record_failed_cycle();
                    }
                }
                let tracked = trackers.diagnostics(&handle.devices());
                emit(&tracked, format, || render::human_trackers(&tracked))?;

                let mut coordinator = handle.lock().await;
                if coordinator.should_log_diagnostic_summary() {
                    coordinator.log_diagnostic_summary();
                }
                delay = coordinator.next_run_delay();
                info!(
                    next_run_secs = delay.as_secs(),
                    consecutive_errors = coordinator.consecutive_errors(),
                    cycles = handle.cycles(),
                    "cycle complete"
                );
            }
        }
    }

    Ok(())
}
