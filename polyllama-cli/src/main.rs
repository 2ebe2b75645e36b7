//! Polyllama router: one Ollama endpoint in front of a pool of instances.

mod commands;

use clap::Parser;
use polyllama_core::RouterConfig;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Polyllama: route Ollama requests to the instance that has the model
#[derive(Parser, Debug)]
#[command(name = "polyllama-router", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Number of backend instances
    #[arg(short = 'n', long, global = true)]
    instances: Option<usize>,

    /// Directory for JSON log files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors to stderr
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Subcommand (defaults to `serve`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the router
    Serve,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the effective configuration
    Check,
}

impl Cli {
    /// Apply flags on top of the loaded configuration.
    fn apply_overrides(&self, config: &mut RouterConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(instances) = self.instances {
            config.backends.instance_count = instances;
        }
    }

    fn stderr_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable layer for stderr; RUST_LOG wins over -v/-q.
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.stderr_filter()));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    // JSON file layer for structured logging
    let log_dir = cli.log_dir.clone().unwrap_or_else(|| {
        directories::ProjectDirs::from("dev", "polyllama", "polyllama")
            .map(|d| d.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("."))
    });
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "router.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let mut config = polyllama_core::load_config(cli.config.as_deref(), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    cli.apply_overrides(&mut config);

    match cli.command {
        None | Some(Commands::Serve) => commands::serve(config).await,
        Some(Commands::Config { action }) => match action {
            ConfigAction::Show => commands::show_config(&config),
            ConfigAction::Check => commands::check_config(&config),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_to_serve() {
        let cli = Cli::try_parse_from(["polyllama-router"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.stderr_filter(), "info");
    }

    #[test]
    fn test_overrides_applied() {
        let cli = Cli::try_parse_from([
            "polyllama-router",
            "serve",
            "--port",
            "8080",
            "-n",
            "4",
            "--host",
            "127.0.0.1",
        ])
        .unwrap();
        let mut config = RouterConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.backends.instance_count, 4);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let cli = Cli::try_parse_from(["polyllama-router", "config", "show"]).unwrap();
        let mut config = RouterConfig::default();
        config.server.port = 9999;
        cli.apply_overrides(&mut config);
        assert_eq!(config.server.port, 9999);
        assert!(matches!(
            cli.command,
            Some(Commands::Config {
                action: ConfigAction::Show
            })
        ));
    }

    #[test]
    fn test_verbosity() {
        let quiet = Cli::try_parse_from(["polyllama-router", "-q"]).unwrap();
        assert_eq!(quiet.stderr_filter(), "error");
        let debug = Cli::try_parse_from(["polyllama-router", "-v"]).unwrap();
        assert_eq!(debug.stderr_filter(), "debug");
        let trace = Cli::try_parse_from(["polyllama-router", "-vvv"]).unwrap();
        assert_eq!(trace.stderr_filter(), "trace");
    }
}
