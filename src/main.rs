//! EmberMQ broker binary
//!
//! Usage:
//!   embermq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>   Configuration file path (TOML)
//!   -l, --listen <ADDR>   TCP bind address override
//!   --log-level <LEVEL>   Log level override (debug, info, error, fatal)

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use embermq::broker::{Broker, BrokerConfig};
use embermq::config::Config;
use embermq::hooks::{Hooks, PluginRegistry};

/// EmberMQ - MQTT v3.1.1 message broker
#[derive(Parser, Debug)]
#[command(name = "embermq")]
#[command(version)]
#[command(about = "MQTT v3.1.1 compliant message broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// TCP bind address (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level: debug, info, error, fatal (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,
}

/// Compiled-in extensions register here; the `plugins` config key
/// selects and orders them.
fn plugin_registry() -> PluginRegistry {
    PluginRegistry::new()
}

fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = config.logging.level();

    if config.logging.filename.is_empty() {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .compact()
            .init();
        return None;
    }

    let appender = tracing_appender::rolling::daily("logs", &config.logging.filename);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(false)
        .compact()
        .with_writer(file_writer.and(std::io::stderr))
        .init();

    Some(guard)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.log_level = level;
    }

    let _log_guard = init_logging(&config);

    info!("starting EmberMQ");
    if !config.listen.is_empty() {
        info!("  TCP listener: {}", config.listen);
    }
    if config.tls.enabled() {
        info!("  TLS listener: {}", config.tls.listen);
    }
    if !config.websockets.listen.is_empty() {
        info!(
            "  WebSocket listener: {} (path: {})",
            config.websockets.listen, config.websockets.path
        );
    }
    if config.websockets.wss.enabled() {
        info!("  Secure WebSocket listener: {}", config.websockets.wss.listen);
    }
    info!("  session store: {}", config.storage.path);

    let registry = plugin_registry();
    let (hooks, unknown) = registry.build(&config.plugins);
    for name in unknown {
        eprintln!("unknown plugin '{}' in config", name);
    }
    if !config.plugins.is_empty() {
        info!("  plugins: {}", config.plugins.join(", "));
    }

    let broker_config = BrokerConfig::from(&config);
    let hooks: Arc<dyn Hooks> = Arc::new(hooks);

    let broker = match Broker::with_hooks(broker_config, hooks) {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("failed to start broker: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = broker.run().await {
        eprintln!("broker error: {}", e);
        std::process::exit(1);
    }
}
