use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info};

use pasarela::config::{Config, ConfigError, DestinationSpec};
use pasarela::destination::{
    Destination, FirstAvailableDestination, FirstRingDestination, MetadataDestination,
    RoundRobinDestination,
};
use pasarela::metadata::session::MySqlSessionFactory;
use pasarela::metadata::TopologyCache;
use pasarela::routing::AccessMode;
use pasarela::Router;

/// Connect budget for sessions against the metadata servers.
const METADATA_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variable carrying the metadata user's password. Secret
/// storage is out of scope for the router itself.
const METADATA_PASSWORD_ENV: &str = "PASARELA_METADATA_PASSWORD";

#[derive(Parser)]
#[command(name = "pasarela")]
#[command(about = "A TCP connection router for managed MySQL replica sets")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "pasarela.toml")]
        config: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Generate example configuration files
    Config {
        /// Destination kind (static or metadata)
        #[arg(short, long)]
        kind: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config } => run_router(config).await,
        Commands::Validate { config } => validate_config(config),
        Commands::Config { kind, output } => generate_config(kind, output),
        Commands::Version => {
            show_version();
            Ok(())
        }
    };

    if let Err(message) = result {
        eprintln!("{}", message);
        std::process::exit(1);
    }
}

async fn run_router(config_path: PathBuf) -> Result<(), String> {
    let config = Config::load_from_file(&config_path)
        .map_err(|e| format!("Failed to load config from {:?}: {}", config_path, e))?;

    init_logging(&config);
    info!("Starting pasarela v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);

    // One shared cache serves every metadata-backed route.
    let cache = match &config.metadata_cache {
        Some(section) => {
            let endpoints = section
                .bootstrap_endpoints()
                .map_err(|e| format!("option bootstrap_server_addresses in [metadata_cache] {}", e))?;
            let ssl = section
                .ssl_config()
                .map_err(|e| format!("option ssl_mode in [metadata_cache] {}", e))?;
            let cluster = section.metadata_cluster.clone().unwrap_or_default();
            let user = section.user.clone().unwrap_or_default();
            let password = std::env::var(METADATA_PASSWORD_ENV).unwrap_or_default();

            let factory = Arc::new(MySqlSessionFactory::new(
                user,
                password,
                METADATA_CONNECT_TIMEOUT,
                ssl,
            ));
            let cache = TopologyCache::new(
                factory,
                endpoints,
                cluster,
                Duration::from_secs(section.ttl),
            );
            Arc::clone(&cache).start().await;
            Some(cache)
        }
        None => None,
    };

    let mut routers = Vec::new();
    let mut handles = Vec::new();
    for (name, route_config) in &config.routes {
        let settings = route_config
            .to_route_settings(name)
            .map_err(|e| e.to_string())?;
        let spec = route_config
            .destination_spec(settings.protocol)
            .map_err(|e| format!("option destinations in [routes.{}] {}", name, e))?;

        let destination: Arc<dyn Destination> = match spec {
            DestinationSpec::Static(endpoints) => {
                let destination: Arc<dyn Destination> = match settings.mode {
                    AccessMode::ReadOnly => Arc::new(RoundRobinDestination::new()),
                    AccessMode::ReadWrite => Arc::new(FirstAvailableDestination::new()),
                    AccessMode::ReadWriteRing => Arc::new(FirstRingDestination::new()),
                };
                for endpoint in endpoints {
                    destination.add(endpoint);
                }
                destination
            }
            DestinationSpec::Metadata(uri) => {
                let cache = cache
                    .as_ref()
                    .ok_or("Routing needs Metadata Cache, but none was found in configuration")?;
                Arc::new(MetadataDestination::new(
                    Arc::clone(cache),
                    uri,
                    settings.mode,
                    settings.protocol,
                ))
            }
        };

        let router = Router::new(settings, destination).map_err(|e| e.to_string())?;
        // a route that cannot bind is fatal for the route, not the process
        match Arc::clone(&router).start().await {
            Ok(handle) => {
                routers.push(router);
                handles.push(handle);
            }
            Err(e) => error!("{}: {}", name, e),
        }
    }

    if routers.is_empty() {
        return Err("no route could be started".to_string());
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed waiting for shutdown signal: {}", e))?;
    info!("Shutdown requested, stopping routes");

    for router in &routers {
        router.stop();
    }
    if let Some(cache) = &cache {
        cache.stop();
    }
    // acceptors observe the stop flag at their next polling boundary;
    // in-flight sessions drain naturally
    futures::future::join_all(handles).await;
    info!("All routes stopped");

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<(), String> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Routes: {}", config.routes.len());
            for (name, route) in &config.routes {
                println!(
                    "    {}: mode={} destinations={}",
                    name,
                    route.mode.as_deref().unwrap_or("-"),
                    route.destinations.as_deref().unwrap_or("-")
                );
            }
            if config.metadata_cache.is_some() {
                println!("  Metadata cache: configured");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            let detail = match &e {
                ConfigError::Io(message) => format!("  File error: {}", message),
                ConfigError::Parse(message) => format!("  Parse error: {}", message),
                ConfigError::Serialize(message) => format!("  Serialization error: {}", message),
                ConfigError::Validation(message) => format!("  {}", message),
            };
            Err(detail)
        }
    }
}

fn generate_config(kind: String, output: PathBuf) -> Result<(), String> {
    println!("Generating {} configuration file: {:?}", kind, output);

    Config::create_example_config(&output, &kind)
        .map_err(|e| format!("Failed to generate config: {}", e))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  pasarela run --config {:?}", output);

    Ok(())
}

fn show_version() {
    println!("pasarela v{}", env!("CARGO_PKG_VERSION"));
    println!("A TCP connection router for managed MySQL replica sets");
    println!();
    println!("Features:");
    println!("  • Classic and X protocol routing with handshake-aware timeouts");
    println!("  • Static destination lists: round-robin, first-available, failover ring");
    println!("  • Metadata-cache destinations following the live replica set topology");
    println!("  • Per-source-host connection error blocking");
}

fn init_logging(config: &Config) {
    let log_level = match config.logging.level.as_str() {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    info!("Logging initialized at level: {:?}", log_level);
}
