use clap::{Parser, Subcommand};
use fleet_agent::agent::{render_local_policy, Agent};
use fleet_agent::config::{default_config_dir, load_settings, AgentSettings, Environment};
use fleet_agent::fleet::store;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleet-agent")]
#[command(about = "Compiles agent policies into per-program configuration and runs fleet actions")]
#[command(version)]
struct Cli {
    /// Configuration directory (default: /etc/fleet-agent if it exists, otherwise ~/.config/fleet-agent)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    /// Data directory for state, agent identity and rendered programs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted
    Run {
        /// Serve Prometheus metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,
    },
    /// Render the local policy and print the programs of each routing key
    Inspect,
    /// Print the persisted fleet state
    State,
}

fn environment(cli: &Cli) -> anyhow::Result<(AgentSettings, Environment)> {
    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    let mut settings = load_settings(&config_dir)?;
    if let Some(data_dir) = &cli.data_dir {
        settings.paths.data = Some(data_dir.clone());
    }
    let env = Environment::new(config_dir, &settings);
    Ok((settings, env))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let (settings, env) = environment(&cli)?;
    match cli.command {
        Commands::Run { metrics_port } => {
            let mut agent = Agent::new(settings, env)?;
            if let Some(port) = metrics_port {
                agent = agent.with_metrics_port(port);
            }
            agent.start().await?;
            agent.run_until_signal().await?;
        }
        Commands::Inspect => {
            let table = render_local_policy(&settings, env)?;
            if table.is_empty() {
                println!("No programs");
            }
            for (key, programs) in table.iter() {
                println!("{}:", key);
                for program in programs {
                    println!("  # {} ({})", program.name(), program.hash());
                    for line in program.config.to_yaml_string()?.lines() {
                        println!("  {}", line);
                    }
                }
            }
        }
        Commands::State => {
            let path = env.state_path();
            if !path.exists() {
                println!("No state at {}", path.display());
                return Ok(());
            }
            print!("{}", store::describe(&path)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
