//! honeycomb - basemap cache build and upload tool.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use honeycomb_app::{AppConfig, Controller};
use honeycomb_pipeline::{CacheOptions, LevelRange, RefreshOptions};

#[derive(Parser)]
#[command(name = "honeycomb", version, about = "Builds and ships the state basemap tile caches")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the external source-data refresh
    UpdateData {
        #[arg(long)]
        static_only: bool,
        #[arg(long)]
        sgid_only: bool,
        #[arg(long)]
        external_only: bool,
        /// Refresh immediately instead of waiting for the nightly window
        #[arg(long)]
        dont_wait: bool,
    },
    /// Full cache and upload for one basemap
    Cache {
        /// Name of a registered basemap
        name: String,
        /// Preserve existing tiles and only fill gaps
        #[arg(long)]
        missing_only: bool,
        /// Skip the source-data refresh
        #[arg(long)]
        skip_update: bool,
        /// Skip the test cache
        #[arg(long)]
        skip_test: bool,
        /// Bound the build to this polygon geometry
        #[arg(long, value_name = "PATH")]
        spot: Option<PathBuf>,
        /// Restrict the build to levels N-M
        #[arg(long, value_name = "N-M")]
        levels: Option<String>,
        /// Refresh data immediately instead of waiting for the nightly window
        #[arg(long)]
        dont_wait: bool,
    },
    /// Upload an already-exploded cache
    Upload {
        /// Name of a registered basemap
        name: String,
    },
    /// Interactively walk the loop-eligible basemaps
    Loop,
    /// Continue the persisted job
    Resume,
    /// Delete local tile directories and any live job
    Cleanup,
    /// Print average durations per basemap and task
    Stats,
    /// Build and publish one vector basemap
    Vector {
        /// Name of a vector basemap
        name: String,
    },
    /// Build and publish every vector basemap
    VectorAll,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init,
    /// Update one configuration field
    Set {
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
    },
    /// Register or unregister basemaps
    Basemaps {
        /// Register a basemap by name
        #[arg(long)]
        add: Option<String>,
        /// Destination bucket for --add
        bucket: Option<String>,
        /// Include the basemap in the loop command
        #[arg(long = "loop")]
        loop_eligible: bool,
        /// Unregister a basemap by name
        #[arg(long)]
        remove: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_dir = AppConfig::default_dir()?;

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Init => {
                let path = AppConfig::init(&config_dir)?;
                println!("config file: {}", path.display());
            }
            ConfigAction::Set { key, value } => {
                println!("{}", AppConfig::set_value(&config_dir, &key, &value)?);
            }
            ConfigAction::Basemaps {
                add,
                bucket,
                loop_eligible,
                remove,
            } => {
                if let Some(name) = add {
                    println!(
                        "{}",
                        AppConfig::add_basemap(&config_dir, &name, bucket, loop_eligible)?
                    );
                } else if let Some(name) = remove {
                    println!("{}", AppConfig::remove_basemap(&config_dir, &name)?);
                } else {
                    anyhow::bail!("pass --add NAME or --remove NAME");
                }
            }
        },
        Command::UpdateData {
            static_only,
            sgid_only,
            external_only,
            dont_wait,
        } => {
            let controller = Controller::load(config_dir)?;
            controller
                .update_data(
                    RefreshOptions {
                        static_only,
                        sgid_only,
                        external_only,
                    },
                    dont_wait,
                )
                .await?;
        }
        Command::Cache {
            name,
            missing_only,
            skip_update,
            skip_test,
            spot,
            levels,
            dont_wait,
        } => {
            let levels = levels.map(|text| LevelRange::parse(&text)).transpose()?;
            let controller = Controller::load(config_dir)?;
            controller
                .cache(
                    &name,
                    CacheOptions {
                        missing_only,
                        skip_update,
                        skip_test,
                        spot,
                        levels,
                        dont_wait,
                    },
                )
                .await?;
        }
        Command::Upload { name } => {
            Controller::load(config_dir)?.upload(&name).await?;
        }
        Command::Loop => {
            Controller::load(config_dir)?.run_loop().await?;
        }
        Command::Resume => {
            Controller::load(config_dir)?.resume().await?;
        }
        Command::Cleanup => {
            Controller::load(config_dir)?.cleanup()?;
        }
        Command::Stats => {
            Controller::load(config_dir)?.print_stats();
        }
        Command::Vector { name } => {
            Controller::load(config_dir)?.vector(&name).await?;
        }
        Command::VectorAll => {
            Controller::load(config_dir)?.vector_all().await?;
        }
    }

    Ok(())
}
