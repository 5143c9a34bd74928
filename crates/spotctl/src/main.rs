//! spotctl — preemptible batch instance controller
//!
//! Runs reconciliation passes, admits or stops instances and shows derived
//! lifecycle status for a fleet of preemptible batch workers.

use clap::{Parser, Subcommand};
use spot_config::{ControllerConfig, DEFAULT_CONFIG_PATH};
use spotctl::{controller_from_path, render_audit_table, render_status_table};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "spotctl")]
#[command(about = "Preemptible batch instance controller")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass and print what was done
    Monitor,

    /// Run reconciliation passes on a fixed interval
    Watch {
        /// Seconds between passes
        #[arg(long, default_value_t = 300)]
        interval: u64,

        /// Stop after this many passes (default: run forever)
        #[arg(long)]
        passes: Option<u64>,
    },

    /// Start an instance, creating it if it does not exist
    Start {
        group: String,
        index: u32,
    },

    /// Stop an instance if it exists
    Stop {
        group: String,
        index: u32,
    },

    /// Stop every live instance in every group
    StopAll,

    /// Show derived lifecycle state for every live instance
    Status {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Ask the provider directly for one instance's status
    Probe {
        group: String,
        index: u32,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        output: PathBuf,

        /// Provider project id
        #[arg(long)]
        project: Option<String>,
    },

    /// Print the boot-time startup script attached to created instances
    StartupScript,

    /// Run one reconciliation pass, then print Prometheus metrics
    Metrics,

    /// Run one reconciliation pass, then print the actions it attempted
    Audit {
        /// Only show actions against this instance
        #[arg(long)]
        instance: Option<String>,

        /// Most recent entries to show
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Emit the whole trail as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so table, JSON and script output stay clean.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::from_default_env()
                .add_directive("spotctl=info".parse()?)
                .add_directive("spot_controller=info".parse()?)
                .add_directive("spot_cache=info".parse()?),
        )
        .init();

    match cli.command {
        Commands::Monitor => {
            let controller = controller_from_path(&cli.config)?;
            print!("{}", controller.monitor().await?);
        }
        Commands::Watch { interval, passes } => {
            watch(cli.config, interval, passes).await?;
        }
        Commands::Start { group, index } => {
            let controller = controller_from_path(&cli.config)?;
            print!("{}", controller.start_or_create(&group, index).await?);
        }
        Commands::Stop { group, index } => {
            let controller = controller_from_path(&cli.config)?;
            print!("{}", controller.stop(&group, index).await?);
        }
        Commands::StopAll => {
            let controller = controller_from_path(&cli.config)?;
            print!("{}", controller.stop_all().await?);
        }
        Commands::Status { json } => {
            let controller = controller_from_path(&cli.config)?;
            let rows = controller.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print!("{}", render_status_table(&rows));
            }
        }
        Commands::Probe { group, index } => {
            let controller = controller_from_path(&cli.config)?;
            match controller.instance_status(&group, index).await? {
                Some(status) => println!("{}: {status}", spot_proto::instance_name(&group, index)),
                None => println!("{}: not found", spot_proto::instance_name(&group, index)),
            }
        }
        Commands::InitConfig { output, project } => {
            init_config(output, project)?;
        }
        Commands::StartupScript => {
            print!("{}", spot_provider::startup_script());
        }
        Commands::Metrics => {
            let controller = controller_from_path(&cli.config)?;
            controller.monitor().await?;
            print!("{}", controller.render_metrics());
        }
        Commands::Audit { instance, limit, json } => {
            let controller = controller_from_path(&cli.config)?;
            controller.monitor().await?;
            if json {
                println!("{}", controller.audit().to_json());
            } else {
                let entries = controller.audit().query(None, instance.as_deref(), limit);
                print!("{}", render_audit_table(&entries));
            }
        }
    }

    Ok(())
}

// ─── Watch ───────────────────────────────────────────────────────────────────

async fn watch(config_path: PathBuf, interval_secs: u64, passes: Option<u64>) -> anyhow::Result<()> {
    let controller = controller_from_path(&config_path)?;
    info!(
        config = %config_path.display(),
        interval = interval_secs,
        passes = ?passes,
        "watching fleet"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    let mut done = 0u64;
    loop {
        ticker.tick().await;
        match controller.monitor().await {
            Ok(report) => print!("{report}"),
            Err(e) => error!(error = %e, "reconciliation pass failed"),
        }
        done += 1;
        if passes.is_some_and(|limit| done >= limit) {
            break;
        }
    }
    Ok(())
}

// ─── Init config ─────────────────────────────────────────────────────────────

fn init_config(output: PathBuf, project: Option<String>) -> anyhow::Result<()> {
    let mut config = ControllerConfig::sample();
    if let Some(project) = project {
        config.project = project;
    }
    config.save(&output)?;
    println!("Config written to {}", output.display());
    println!("Edit zones and groups, then run: spotctl --config {} monitor", output.display());
    Ok(())
}
