use clap::Parser;
use forager::config::{BrokerConfig, EngineConfig, HttpConfig};
use forager::engine::Engine;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Runs a forager engine with no plugins installed; useful as a traffic
/// relay and as the deployment template for embedders.
#[derive(Parser)]
#[command(author, version, about = "Forager plugin runtime")]
struct Cli {
    /// Broker hostname
    #[arg(long, default_value = "localhost")]
    broker_host: String,

    /// Broker port
    #[arg(long, default_value_t = 1883)]
    broker_port: u16,

    /// Broker username
    #[arg(long)]
    broker_username: Option<String>,

    /// Broker password
    #[arg(long)]
    broker_password: Option<String>,

    /// Base client id for broker connections
    #[arg(long, default_value = "forager")]
    broker_client_id: String,

    /// Concurrent outbound HTTP requests
    #[arg(long, default_value_t = 32)]
    http_concurrency: usize,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn to_config(&self) -> EngineConfig {
        EngineConfig {
            http: HttpConfig {
                concurrency: self.http_concurrency,
                ..HttpConfig::default()
            },
            broker: BrokerConfig {
                host: self.broker_host.clone(),
                port: self.broker_port,
                username: self.broker_username.clone(),
                password: self.broker_password.clone(),
                client_id: self.broker_client_id.clone(),
                ..BrokerConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(fmt::layer())
        .init();

    let engine = match Engine::new(cli.to_config(), Vec::new()) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = engine.start() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }

    info!("listening for traffic on the queue (ctrl-c to stop)");
    let _ = tokio::signal::ctrl_c().await;

    if let Err(err) = engine.shutdown() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
    engine.event_loop().join().await;
}
