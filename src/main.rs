//! Command-line front end for the identity rotation manager.

use std::error::Error;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{ArgGroup, Parser, Subcommand};
use serde::Serialize;

use identity_rotation::{
    logging, AgentStatus, ConfigUpdate, ManagerOptions, RotationConfig, RotationManager,
};

#[derive(Parser)]
#[command(name = "identity-rotation")]
#[command(about = "Allocate and rotate network identities for a fleet of agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config snapshot to load and update
    #[arg(long, global = true, default_value = "rotation_config.json")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current identities
    Status {
        /// Only this agent
        #[arg(long)]
        agent: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Rotate identities now
    #[command(group(ArgGroup::new("target").required(true).args(["agent", "all"])))]
    Rotate {
        #[arg(long)]
        agent: Option<String>,

        #[arg(long)]
        all: bool,
    },

    /// Show or change per-agent settings
    Config {
        #[arg(long)]
        agent: Option<String>,

        /// e.g. --set alpha rotation_interval 60
        #[arg(long, num_args = 3, value_names = ["AGENT", "KEY", "VALUE"])]
        set: Option<Vec<String>>,
    },

    /// TCP-probe assigned identities
    #[command(group(ArgGroup::new("target").required(true).args(["agent", "all"])))]
    Probe {
        #[arg(long)]
        agent: Option<String>,

        #[arg(long)]
        all: bool,
    },

    /// Per-agent rotation report
    Report {
        #[arg(long)]
        json: bool,
    },

    /// Pool and counter statistics
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Run the schedulers and print status periodically
    Monitor {
        /// Seconds between updates
        #[arg(long, default_value = "5")]
        interval: u64,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Proxy endpoint catalog
    #[command(group(ArgGroup::new("action").required(true).args(["refresh", "status"])))]
    Endpoints {
        #[arg(long)]
        refresh: bool,

        #[arg(long)]
        status: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logging::init();
    let cli = Cli::parse();

    let config = RotationConfig::load_or_default(&cli.config);
    let manager = RotationManager::with_options(
        config,
        ManagerOptions {
            config_path: Some(cli.config.clone()),
            ..ManagerOptions::default()
        },
    )?;

    let result = run(&manager, cli.command).await;
    manager.shutdown().await;
    result
}

async fn run(manager: &RotationManager, command: Commands) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Status { agent, json } => match agent {
            Some(id) => {
                let status = manager.status(&id)?;
                if json {
                    print_json(&status)?;
                } else {
                    print_status(&status);
                }
            }
            None => {
                let statuses = manager.all_statuses();
                if json {
                    print_json(&statuses)?;
                } else {
                    println!("=== Agent status ===");
                    for status in statuses.values() {
                        println!();
                        print_status(status);
                    }
                }
            }
        },
        Commands::Rotate { agent, all } => {
            if all {
                for (id, result) in manager.force_rotate_all() {
                    match result {
                        Ok(outcome) => println!("{id}: {} -> {}", outcome.previous, outcome.current),
                        Err(e) => println!("{id}: failed: {e}"),
                    }
                }
            } else if let Some(id) = agent {
                let outcome = manager.force_rotate(&id)?;
                println!("{id}: {} -> {}", outcome.previous, outcome.current);
            }
        }
        Commands::Config { agent, set } => {
            if let Some(args) = set {
                let [id, key, value] = <[String; 3]>::try_from(args)
                    .map_err(|_| "--set takes AGENT KEY VALUE")?;
                let update = ConfigUpdate::from_key_value(&key, &value)?;
                if manager.update_config(&id, update)? {
                    println!("{id}: {key} = {value}");
                } else {
                    println!("agent {id} not found");
                }
            } else if let Some(id) = agent {
                let status = manager.status(&id)?;
                println!("=== Configuration for {id} ===");
                println!("Rotation interval: {}s", status.rotation_interval_secs);
                println!("Proxy enabled:     {}", status.proxy_enabled);
                println!("Tunnel enabled:    {}", status.tunnel_enabled);
                println!("Stealth mode:      {}", status.stealth_mode);
                println!("Proxies:           {}", status.assigned_proxies.len());
                println!("Tunnel endpoints:  {}", status.assigned_tunnel_endpoints.len());
            } else {
                print_json(&manager.config_snapshot())?;
            }
        }
        Commands::Probe { agent, all } => {
            let ids = if all { manager.agent_ids() } else { agent.into_iter().collect() };
            for id in ids {
                let result = manager.probe_connectivity(&id).await?;
                match (result.reachable, result.error) {
                    (true, _) => println!(
                        "{id} {}: reachable ({}ms)",
                        result.identity,
                        result.latency_ms.unwrap_or_default()
                    ),
                    (false, error) => println!(
                        "{id} {}: unreachable ({})",
                        result.identity,
                        error.unwrap_or_default()
                    ),
                }
            }
        }
        Commands::Report { json } => {
            let report = manager.rotation_report();
            if json {
                print_json(&report)?;
            } else {
                println!("=== Rotation report ({}) ===", report.generated_at);
                for (id, agent) in &report.agents {
                    println!(
                        "{id}: every {}s, {} rotations, last {}, proxy={} tunnel={} stealth={}",
                        agent.rotation_interval_secs,
                        agent.total_rotations,
                        agent.last_rotation,
                        agent.proxy_enabled,
                        agent.tunnel_enabled,
                        agent.stealth_mode
                    );
                }
            }
        }
        Commands::Stats { json } => {
            let stats = manager.statistics();
            if json {
                print_json(&stats)?;
            } else {
                println!("Agents:              {}", stats.total_agents);
                println!("Free identities:     {}", stats.free_identities);
                println!("Assigned identities: {}", stats.assigned_identities);
                println!("Total identities:    {}", stats.total_identities);
                println!("Proxy endpoints:     {}", stats.proxy_endpoints);
                println!("Rotations:           {}", stats.counters.rotations_completed);
                println!("Failed rotations:    {}", stats.counters.rotations_failed);
                println!("Regenerations:       {}", stats.counters.regenerations);
            }
        }
        Commands::Monitor { interval, duration } => {
            manager.start();
            let interval = Duration::from_secs(interval.max(1));
            let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
            loop {
                for status in manager.all_statuses().values() {
                    println!(
                        "{} {} next rotation {}",
                        status.agent_id, status.identity, status.next_rotation_at
                    );
                }
                if deadline.map_or(false, |d| Instant::now() >= d) {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Commands::Endpoints { refresh, .. } => {
            for line in endpoint_report(manager, refresh).await {
                println!("{line}");
            }
        }
    }
    Ok(())
}

/// Every invocation starts with an empty catalog, so it is loaded first.
async fn endpoint_report(manager: &RotationManager, show_fetch: bool) -> Vec<String> {
    let result = manager.refresh_endpoints().await;
    let mut lines = Vec::new();
    if show_fetch {
        lines.push(format!(
            "fetched {} endpoints, replaced: {}",
            result.fetched, result.replaced
        ));
    }
    for source in &result.failed_sources {
        lines.push(format!("failed: {source}"));
    }
    lines.push(format!("Proxy endpoints: {}", manager.statistics().proxy_endpoints));
    for status in manager.all_statuses().values() {
        lines.push(format!(
            "{}: {} proxies, active {}",
            status.agent_id,
            status.assigned_proxies.len(),
            status.active_proxy().unwrap_or("-")
        ));
        if status.tunnel_enabled {
            lines.push(format!(
                "{}: {} tunnel endpoints, active {}",
                status.agent_id,
                status.assigned_tunnel_endpoints.len(),
                status.active_tunnel_endpoint().unwrap_or("-")
            ));
        } else {
            lines.push(format!("{}: tunnel disabled", status.agent_id));
        }
    }
    lines
}

fn print_status(status: &AgentStatus) {
    println!("--- {} ---", status.agent_id);
    println!("Identity:       {}", status.identity);
    println!("Last rotation:  {}", status.assigned_at);
    println!("Next rotation:  {}", status.next_rotation_at);
    println!("Proxy enabled:  {}", status.proxy_enabled);
    println!("Tunnel enabled: {}", status.tunnel_enabled);
    println!("Stealth mode:   {}", status.stealth_mode);
    println!("History:        {}", status.history.len());
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
