//! CLI entry point for heartbridge

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use heartbridge_core::broker::InMemoryBroker;
use heartbridge_core::config::{Config, ConfigLoader, EndpointConfig};
use heartbridge_core::logging::init_logging;
use heartbridge_relay::Relay;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "heartbridge")]
#[command(about = "Relay messages between two brokers without starving heartbeats")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay until Ctrl+C
    Run {
        /// Only log inbound messages instead of republishing them
        #[arg(long)]
        no_forward: bool,
        /// Stop pumping the outbound connection (the broker will drop it)
        #[arg(long)]
        skip_heartbeats: bool,
        /// Message to put on the upstream queue at startup (repeatable)
        #[arg(short, long = "inject", value_name = "MSG")]
        inject: Vec<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_loader = if let Some(dir) = cli.config_dir {
        ConfigLoader::with_dir(dir)
    } else {
        ConfigLoader::new()
    };
    let config = config_loader.load()?;
    let _log_guard = init_logging(&config.logging);

    match cli.command {
        Commands::Run {
            no_forward,
            skip_heartbeats,
            inject,
        } => {
            info!("Starting relay");
            run_relay(config, no_forward, skip_heartbeats, inject).await?;
        }
        Commands::Config => {
            info!(dir = %config_loader.config_dir().display(), "Showing configuration");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// In-process broker answering to the endpoint's host, vhost and login
fn broker_for(endpoint: &EndpointConfig) -> InMemoryBroker {
    InMemoryBroker::new(&endpoint.host)
        .with_virtual_host(&endpoint.virtual_host)
        .with_user(&endpoint.username, &endpoint.password)
}

/// Seed the upstream queue. On failure the relay is shut down before the
/// error is returned.
async fn inject_messages(
    relay: Relay,
    upstream: &InMemoryBroker,
    queue: &str,
    messages: Vec<String>,
) -> Result<Relay> {
    let injected = messages
        .into_iter()
        .try_for_each(|message| upstream.publish_to(queue, message));
    if let Err(e) = injected {
        if let Err(stop_err) = relay.shutdown().await {
            warn!(error = %stop_err, "Failed to shut down relay after injection failed");
        }
        return Err(e.into());
    }
    Ok(relay)
}

async fn run_relay(
    mut config: Config,
    no_forward: bool,
    skip_heartbeats: bool,
    inject: Vec<String>,
) -> Result<()> {
    if no_forward {
        config.bridge.forward = false;
    }
    if skip_heartbeats {
        config.bridge.service_heartbeats = false;
        warn!("Heartbeat servicing disabled on the outbound connection");
    }

    println!("{}", style("Starting heartbridge...").bold().cyan());
    let upstream = broker_for(&config.upstream);
    let downstream = broker_for(&config.downstream);

    let relay = Relay::connect(&config, &upstream, &downstream).await?;
    let relay = inject_messages(relay, &upstream, &config.upstream.queue, inject).await?;

    println!(
        "  {} {} -> {} {}",
        style(&config.upstream.host).cyan(),
        config.upstream.queue,
        style(&config.downstream.host).cyan(),
        if config.bridge.forward {
            config.downstream.queue.as_str()
        } else {
            "(forwarding disabled)"
        }
    );
    println!(
        "{}",
        style("Relay is running. Press Ctrl+C to stop.").green()
    );

    let shutdown = CancellationToken::new();
    let mut running = tokio::spawn(relay.run(shutdown.clone()));

    let stats = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("\n{}", style("Shutting down...").yellow());
            shutdown.cancel();
            (&mut running).await??
        }
        finished = &mut running => finished??,
    };

    println!("{}", style("Relay stopped.").green());
    println!("{}", style("Summary:").bold());
    println!("  received:  {}", stats.received);
    println!("  acked:     {}", stats.acked);
    println!("  nacked:    {}", stats.nacked);
    println!("  forwarded: {}", stats.forwarded);

    if config.bridge.forward {
        let delivered = downstream.peek(&config.downstream.queue);
        println!(
            "{}",
            style(format!(
                "{} ({} messages):",
                config.downstream.queue,
                delivered.len()
            ))
            .bold()
        );
        for body in delivered {
            println!("  {}", String::from_utf8_lossy(&body));
        }
    }

    Ok(())
}
