mod bridge;
mod config;

use bridge::TaskBridge;
use clap::{Parser, Subcommand, ValueEnum};
use config::AppConfig;
use std::path::PathBuf;
use std::time::Duration;
use switchyard_builtins::register_builtins;
use switchyard_bus::MessageBus;
use switchyard_core::HealthState;
use switchyard_registry::AgentRegistry;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "switchyard", about = "Switchyard: agent registry and message bus host")]
struct Cli {
    /// Path to config file (defaults to switchyard.toml, optional)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the registry, the message bus and the built-in agents
    Serve,
    /// List the built-in agents
    Agents,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let config = AppConfig::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Agents => {
            let registry = AgentRegistry::new(config.registry);
            register_builtins(&registry, &config.builtins).await;

            let agents = registry.list_agents(None, None).await;
            if agents.is_empty() {
                println!("No built-in agents enabled.");
                println!("Enable them in switchyard.toml under [builtins]");
            } else {
                println!("Built-in agents:");
                for agent in &agents {
                    println!("  {} {} ({})", agent.agent_id, agent.name, agent.agent_type);
                    println!("    Capabilities: {}", agent.capabilities.join(", "));
                }
                println!("\nTotal: {} agent(s)", agents.len());
            }
        }
    }

    Ok(())
}

/// The worse of the registry's and the bus's health.
async fn overall_health(registry: &AgentRegistry, bus: &MessageBus) -> HealthState {
    let registry_health = registry.health_check().await;
    let bus_health = bus.health_check().await;
    registry_health.status.worst(bus_health.status)
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let bus = MessageBus::try_new(config.bus)
        .map_err(|e| anyhow::anyhow!("Invalid bus configuration: {e}"))?;
    let registry = AgentRegistry::new(config.registry);

    registry.start().await;
    if let Err(e) = bus.start().await {
        registry.stop().await;
        return Err(anyhow::anyhow!("Failed to start message bus: {e}"));
    }

    let ids = register_builtins(&registry, &config.builtins).await;
    for id in &ids {
        if !registry.start_agent(id).await {
            warn!(agent_id = %id, "Built-in agent failed to start");
        }
    }

    let bridge = TaskBridge::new(registry.clone(), bus.clone());
    if let Err(e) = bridge.start().await {
        bus.stop().await;
        registry.stop().await;
        return Err(anyhow::anyhow!("Failed to start task bridge: {e}"));
    }

    info!(agents = ids.len(), "Switchyard running, press Ctrl-C to stop");
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut health_ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
    let signal = loop {
        tokio::select! {
            signal = &mut shutdown => break signal,
            _ = health_ticker.tick() => {
                let status = overall_health(&registry, &bus).await;
                if status == HealthState::Healthy {
                    info!(status = %status, "Switchyard health");
                } else {
                    warn!(status = %status, "Switchyard health");
                }
            }
        }
    };
    info!("Shutting down");

    bus.stop().await;
    registry.stop().await;
    signal?;
    Ok(())
}
