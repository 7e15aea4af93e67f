mod accumulator;
mod api;
mod commands;
mod dispatch;
mod ipc;
mod message_loop;
mod queries;
mod queue;
mod sandbox;
mod scheduler;
mod service;
mod state;

use clap::{Parser, Subcommand};
use relay_core::config;

#[derive(Parser)]
#[command(name = "relay", version, about = "Relay — messaging-driven agent orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the config file.
    #[arg(short, long, default_value = "relay.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (message loop, scheduler, IPC watcher, HTTP surface).
    Start,
    /// Check store and sandbox engine availability.
    Status,
    /// Print the effective configuration as JSON.
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => service::run(cfg).await,
        Commands::Status => status(cfg).await,
        Commands::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(())
        }
    }
}

async fn status(cfg: config::Config) -> anyhow::Result<()> {
    println!("relay — status check\n");

    print!("  store ({}): ", cfg.store.dsn);
    match relay_store::SqliteStore::connect(&cfg.store.dsn).await {
        Ok(_) => println!("ok"),
        Err(e) => println!("unavailable ({e})"),
    }

    print!("  engine ({}): ", cfg.runtimes.engine);
    let available = tokio::process::Command::new(&cfg.runtimes.engine)
        .arg("info")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);
    println!("{}", if available { "ok" } else { "not available" });

    println!(
        "  telegram: {}",
        match &cfg.channel.telegram {
            Some(tg) if tg.enabled && !tg.bot_token.is_empty() => "configured",
            _ => "not configured",
        }
    );
    println!("  runtimes: {}", cfg.runtimes.profiles.len());
    Ok(())
}
