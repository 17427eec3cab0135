pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::config::{FileConfigManager, PropertyType};
use crate::scheduler::platform_registrar;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file, created with defaults if missing
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search every configured site now
    RunNow {
        /// Override the saved location
        #[arg(short, long)]
        location: Option<String>,

        /// Override the saved property types (repeatable)
        #[arg(short = 't', long = "type")]
        property_types: Vec<PropertyType>,

        /// Override the saved target sites (repeatable)
        #[arg(short, long = "site")]
        sites: Vec<String>,

        #[arg(long)]
        min_price: Option<u64>,

        #[arg(long)]
        max_price: Option<u64>,

        /// Override the lookback window in days
        #[arg(short, long)]
        days: Option<u32>,

        /// Show the browser windows
        #[arg(long)]
        headed: bool,

        /// Do not email the report
        #[arg(long)]
        no_email: bool,

        /// Print progress events to stdout as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Entry point for the OS scheduled task
    RunScheduled,

    /// Stay resident and run at the configured times, catching up after downtime
    Daemon,

    /// Register the OS scheduled task
    InstallSchedule {
        /// Daily run time as HH:MM (repeatable); defaults to the configured times
        #[arg(short, long = "time")]
        times: Vec<String>,
    },

    /// Remove the OS scheduled task
    RemoveSchedule,

    /// Show schedule registration and the latest run
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Print the listings from the latest run
    Results {
        #[arg(long)]
        json: bool,
    },
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

pub async fn process_command(cli: Cli) -> Result<()> {
    let config_manager = FileConfigManager::new(cli.config);

    match cli.command {
        Commands::RunNow {
            location,
            property_types,
            sites,
            min_price,
            max_price,
            days,
            headed,
            no_email,
            events,
        } => {
            let overrides = commands::RunOverrides {
                location,
                property_types,
                sites,
                min_price,
                max_price,
                days,
                headed,
            };
            info!("Starting manual run");
            commands::run_now(&config_manager, overrides, !no_email, events).await
        }
        Commands::RunScheduled => {
            info!("Starting scheduled run");
            commands::run_scheduled(&config_manager).await
        }
        Commands::Daemon => commands::daemon(&config_manager).await,
        Commands::InstallSchedule { times } => {
            let registrar = platform_registrar();
            commands::install_schedule(&config_manager, &times, registrar.as_ref()).await
        }
        Commands::RemoveSchedule => {
            let registrar = platform_registrar();
            commands::remove_schedule(&config_manager, registrar.as_ref()).await
        }
        Commands::Status { json } => {
            let registrar = platform_registrar();
            commands::status(&config_manager, registrar.as_ref(), json).await
        }
        Commands::Results { json } => commands::results(&config_manager, json).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_run_now_overrides_parse() {
        let cli = Cli::try_parse_from([
            "cre-crawler",
            "--config",
            "other.toml",
            "run-now",
            "--type",
            "office",
            "-t",
            "multifamily",
            "--site",
            "loopnet.com",
            "--min-price",
            "500000",
            "--no-email",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("other.toml"));
        match cli.command {
            Commands::RunNow {
                property_types,
                sites,
                min_price,
                no_email,
                events,
                ..
            } => {
                assert_eq!(property_types, vec![PropertyType::Office, PropertyType::MultiFamily]);
                assert_eq!(sites, vec!["loopnet.com"]);
                assert_eq!(min_price, Some(500_000));
                assert!(no_email);
                assert!(!events);
            }
            _ => panic!("expected run-now"),
        }
    }

    #[test]
    fn test_unknown_property_type_is_rejected() {
        assert!(Cli::try_parse_from(["cre-crawler", "run-now", "--type", "castle"]).is_err());
    }

    #[test]
    fn test_install_schedule_times() {
        let cli = Cli::try_parse_from(["cre-crawler", "install-schedule", "--time", "03:00", "--time", "15:30"]).unwrap();
        match cli.command {
            Commands::InstallSchedule { times } => assert_eq!(times, vec!["03:00", "15:30"]),
            _ => panic!("expected install-schedule"),
        }
    }
}
