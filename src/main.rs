//! EdgeHub - MQTT v3.1/v3.1.1 edge broker
//!
//! Usage:
//!   edgehub [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use edgehub::acl::AclProvider;
use edgehub::auth::AuthProvider;
use edgehub::broker::{Broker, BrokerConfig};
use edgehub::config::Config;
use edgehub::hooks::CompositeHooks;
use edgehub::metrics::{Metrics, MetricsServer};
use edgehub::persistence::PersistenceManager;
use edgehub::rule::RuleEngine;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    /// Very verbose
    Trace,
}

impl LogLevel {
    fn parse(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }

    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// EdgeHub - MQTT edge broker with rule-based routing
#[derive(Parser, Debug)]
#[command(name = "edgehub")]
#[command(version)]
#[command(about = "MQTT v3.1/v3.1.1 edge broker with rule-based message routing")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    // CLI overrides config, config overrides default (warn)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::parse(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref path) = args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let rules = match RuleEngine::new(&config.rules) {
        Ok(rules) => rules,
        Err(e) => {
            eprintln!("Invalid rule configuration: {}", e);
            std::process::exit(1);
        }
    };

    let broker_config = BrokerConfig::from_config(&config);

    info!("Starting EdgeHub MQTT broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    if let Some(addr) = broker_config.tls_bind_addr {
        info!("  TLS address: {}", addr);
    }
    if let Some(addr) = broker_config.ws_bind_addr {
        info!("  WebSocket address: {}", addr);
    }
    if let Some(addr) = broker_config.wss_bind_addr {
        info!("  WebSocket TLS address: {}", addr);
    }
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Rules: {}", rules.len());

    if config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users configured)",
            config.auth.users.len()
        );
    } else {
        info!("  Authentication: disabled");
    }
    if config.acl.enabled {
        info!("  ACL: enabled ({} roles configured)", config.acl.roles.len());
    } else {
        info!("  ACL: disabled");
    }

    // Auth first, then ACL
    let auth_provider = Arc::new(AuthProvider::new(&config.auth));
    let acl_provider = Arc::new(AclProvider::new(&config.acl, auth_provider.clone()));
    let hooks = Arc::new(CompositeHooks::new().with(auth_provider).with(acl_provider));

    let mut broker = Broker::with_hooks(broker_config, hooks).with_rules(rules);

    if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        broker = broker.with_metrics(metrics.clone());
        info!("  Metrics: enabled (http://{})", config.metrics.bind);

        let server = MetricsServer::new(metrics, config.metrics.bind);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    if config.persistence.enabled {
        let persistence = Arc::new(PersistenceManager::open(&config.persistence)?);
        info!("  Persistence: enabled ({})", config.persistence.path.display());
        broker = broker.with_persistence(persistence);
    } else {
        info!("  Persistence: disabled");
    }

    let broker = Arc::new(broker);
    let runner = broker.clone();
    let mut server = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut server => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Broker error: {}", e);
                    broker.shutdown().await;
                    return Err(e.into());
                }
                Err(e) => error!("Broker task failed: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    broker.shutdown().await;
    Ok(())
}
