//! Inspect what the rescheduler sees and would do, or run it in the foreground.
use controller_core::telemetry;
use rescheduler::{
    capture, ClusterState, CriticalPodMatcher, Exclusions, KubeClusterState, ReschedulerConfig, Selection,
    shutdown_signal, stop_on, StarvationDetector, State, StarvedPod, SystemClock, VictimSelector,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

#[derive(Parser)]
#[command(name = "cli")]
#[command(version, about = "Critical pod rescheduler", long_about = None)]
struct Cli {
    /// YAML config file, overridden by RESCHEDULER_* environment variables
    #[arg(long, short, env = "RESCHEDULER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, short, default_value = "yaml")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current cluster snapshot
    Snapshot,
    /// List starved critical pods, longest waiting first
    Detect,
    /// Show the victims that would be evicted for each starved pod
    Plan,
    /// Run the control loop until interrupted
    Run {
        /// Log decisions without deleting anything
        #[arg(long)]
        dry_run: bool,
        /// Run a single tick and print its report
        #[arg(long)]
        once: bool,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanEntry {
    starved: StarvedPod,
    selection: Selection,
}

fn print<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    let out = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
    };
    println!("{out}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init().await?;
    let cli = Cli::parse();
    let mut config = ReschedulerConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let client = kube::Client::try_default().await.context("connecting to the cluster")?;
    let cluster = Arc::new(KubeClusterState::new(client, &config.reporter));
    let matcher = Arc::new(CriticalPodMatcher::new(config.critical_pods.clone()));
    let clock = Arc::new(SystemClock);

    match cli.command {
        Commands::Snapshot => {
            let snapshot = capture(cluster.as_ref(), matcher.as_ref(), clock.as_ref()).await?;
            print(&snapshot, cli.output)?;
        }
        Commands::Detect => {
            let snapshot = capture(cluster.as_ref(), matcher.as_ref(), clock.as_ref()).await?;
            let starved = StarvationDetector::new(config.pending_grace()).detect(&snapshot);
            print(&starved, cli.output)?;
        }
        Commands::Plan => {
            let snapshot = capture(cluster.as_ref(), matcher.as_ref(), clock.as_ref()).await?;
            let selector = VictimSelector::new(config.evict_unmanaged_pods);
            let mut exclusions = Exclusions::default();
            let mut plan = Vec::new();
            for starved in StarvationDetector::new(config.pending_grace()).detect(&snapshot) {
                let selection = selector.select_excluding(&starved, &snapshot, &exclusions);
                match &selection {
                    Selection::Victims(victims) => {
                        exclusions.reserved_nodes.insert(victims.node.clone());
                        exclusions
                            .in_flight
                            .extend(victims.victims.iter().map(|v| v.id.clone()));
                    }
                    Selection::Satisfied { node } => {
                        exclusions.reserved_nodes.insert(node.clone());
                    }
                    Selection::Infeasible => {}
                }
                plan.push(PlanEntry { starved, selection });
            }
            print(&plan, cli.output)?;
        }
        Commands::Run { dry_run, once } => {
            config.dry_run |= dry_run;
            let cluster: Arc<dyn ClusterState> = cluster;
            let rescheduler = State::default().to_rescheduler(cluster, matcher, clock, config)?;
            if once {
                let report = rescheduler.tick().await;
                print(&report, cli.output)?;
                return Ok(());
            }

            let (shutdown, signal) = watch::channel(false);
            stop_on(shutdown_signal(), shutdown);
            rescheduler.run(signal).await;
        }
    }
    Ok(())
}
