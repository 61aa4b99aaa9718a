use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio_util::sync::CancellationToken;
use crate::initialization::init;
use crate::models::{ContractType, SiteProfile, UsageSample, User};
use crate::time_key::parse_instant;

mod advice;
mod config;
mod consumption;
mod errors;
mod initialization;
mod logging;
mod manager_day_ahead;
mod manager_forecast;
mod manager_store;
pub mod models;
mod scheduler;
mod time_key;
mod worker;

#[derive(Parser)]
#[command(version, about = "Ingests solar forecasts and day-ahead prices and advises on household energy use")]
struct Args {
    /// Path to the configuration file
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Refresh forecasts and prices for all users once
    RefreshAll,
    /// Refresh forecasts and prices for one user
    RefreshUser {
        user: String,
    },
    /// Print the recommendation for the hour containing a timestamp, now by default
    Advice {
        user: String,
        #[arg(long)]
        at: Option<String>,
    },
    /// Store calculations for the upcoming hours of a number of days
    Calculate {
        user: String,
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Create or update a user and optionally the user's solar site
    RegisterUser {
        user: String,
        #[arg(long, value_enum)]
        contract: ContractType,
        #[arg(long)]
        fixed_price: Option<f64>,
        #[arg(long, allow_negative_numbers = true, requires_all = ["longitude", "tilt", "azimuth", "module_power", "panel_count"])]
        latitude: Option<f64>,
        #[arg(long, allow_negative_numbers = true)]
        longitude: Option<f64>,
        #[arg(long)]
        tilt: Option<f64>,
        #[arg(long, allow_negative_numbers = true)]
        azimuth: Option<f64>,
        #[arg(long)]
        module_power: Option<f64>,
        #[arg(long)]
        panel_count: Option<u32>,
    },
    /// Append measured usage for a user from a JSON file holding `{date, hour, usage}` records
    ImportUsage {
        user: String,
        file: String,
    },
    /// Run refreshes at the configured hours until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config and set up all managers. If initialization fails, we can't even log.
    let (config, mgr) = match init(&args.config).await {
        Ok((c, m)) => (c, m),
        Err(e) => {
            return Err(anyhow!("Initialization failed: {}", e));
        }
    };

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    match args.command {
        Command::RefreshAll => {
            let summary = mgr.worker.refresh_all(Utc::now(), &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        },
        Command::RefreshUser { user } => {
            let report = mgr.worker.refresh_user(&user, Utc::now()).await.inspect_err(|e| error!("refresh of user {} failed: {}", user, e))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        },
        Command::Advice { user, at } => {
            let instant = match at {
                Some(at) => parse_instant(&at, config.market.timezone)?,
                None => Utc::now(),
            };
            let recommendation = mgr.advisor.get_advice(&user, instant).await?;
            println!("{}", serde_json::to_string_pretty(&recommendation)?);
        },
        Command::Calculate { user, days } => {
            let generated = mgr.advisor.generate_calculations(&user, days, Utc::now()).await?;
            println!("generated {} calculations for {} days", generated, days);
        },
        Command::RegisterUser { user, contract, fixed_price, latitude, longitude, tilt, azimuth, module_power, panel_count } => {
            mgr.store.upsert_user(User { id: user.clone(), contract_type: contract, fixed_price }).await?;
            info!("registered user {} with {:?} contract", user, contract);

            if let (Some(lat), Some(long), Some(tilt), Some(azimuth), Some(module_power), Some(panel_count)) =
                (latitude, longitude, tilt, azimuth, module_power, panel_count) {
                let profile = SiteProfile { lat, long, tilt, azimuth, module_power, panel_count };
                info!("site of user {}: {} kWp", user, profile.installed_kwp());
                mgr.store.set_site_profile(&user, profile).await?;
            }
        },
        Command::ImportUsage { user, file } => {
            let json = tokio::fs::read_to_string(&file).await?;
            let samples: Vec<UsageSample> = serde_json::from_str(&json)?;
            let count = samples.len();
            mgr.store.add_usage(&user, samples).await?;
            info!("imported {} usage samples for user {} from {}", count, user, file);
            println!("imported {} usage samples", count);
        },
        Command::Run => {
            scheduler::run(&mgr.worker, &config.schedule.run_hours, config.market.timezone, cancel).await?;
        },
    }

    Ok(())
}
