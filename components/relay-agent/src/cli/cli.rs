// Local crates
use crate::{
    helpers::load_config::{CliOverrides, Config},
    instrumentation::tracing::{init_panic_handler, init_tracing},
    runtime,
};

// External crates
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "relay",
    long_about = "Relay reads line-delimited JSON or text from standard input and streams \
                  every line as a structured event to a remote session collector, surviving \
                  disconnects without losing or reordering lines.",
    about = "Stream stdin to a session collector",
    version,
    term_width = 100,
    args_conflicts_with_subcommands = true,
    after_help = "\
    EXAMPLES:
        tail -f app.log | relay --session checkout-debug
        my_service 2>&1 | relay run --server wss://collector.example.com/ws --token $TOKEN
        relay validate --config ./relay.toml"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Relay standard input to the collector (default)
    Run(RunArgs),

    /// Validate the configuration and print the effective settings
    Validate {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Args, Debug, Default, Clone)]
struct RunArgs {
    /// Configuration file (defaults to ./relay.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Collector WebSocket URL, http(s) is mapped to ws(s)
    #[arg(short, long)]
    server: Option<String>,

    /// Session to stream into, generated when omitted
    #[arg(long)]
    session: Option<String>,

    /// Bearer token sent on the handshake
    #[arg(long, env = "RELAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Only print warnings
    #[arg(short, long)]
    quiet: bool,
}

impl RunArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            server_url: self.server.clone(),
            session_id: self.session.clone(),
            auth_token: self.token.clone(),
            quiet: self.quiet,
        }
    }
}

/// Entry function for CLI
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(args)) => run_relay(args).await?,
        None => run_relay(cli.run).await?,
        Some(Commands::Validate { config }) => validate_config(config)?,
        Some(Commands::Version) => show_version(),
    }

    Ok(())
}

//
// ------------------------ Command Implementations ------------------------------
//

async fn run_relay(args: RunArgs) -> Result<()> {
    let cfg = Config::load(args.config.as_deref(), &args.overrides())?;

    // Flushes buffered log lines when dropped at the end of the run
    let _guard = init_tracing(&cfg.logging)?;
    init_panic_handler();

    runtime::runtime::run_relay(cfg).await?;
    Ok(())
}

/// Validate configuration file
fn validate_config(config: Option<PathBuf>) -> Result<()> {
    let cfg = Config::load(config.as_deref(), &CliOverrides::default())?;
    crate::transport::transport::resolve_endpoint(&cfg.general.server_url)
        .context("Invalid general.server_url")?;
    if let Some(session) = cfg.general.session_id.as_deref() {
        crate::helpers::session_id::SessionId::normalize(Some(session))
            .context("Invalid general.session_id")?;
    }

    println!("Configuration valid:\n{cfg:#?}");
    Ok(())
}

/// Show version information
fn show_version() {
    println!("relay {}", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_flags_run_without_subcommand() {
        let cli = Cli::try_parse_from(["relay", "--session", "demo", "--quiet"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.run.session.as_deref(), Some("demo"));
        assert!(cli.run.quiet);
    }

    #[test]
    fn run_subcommand_maps_flags_to_overrides() {
        let cli = Cli::try_parse_from([
            "relay",
            "run",
            "--server",
            "https://collector.example.com/ws",
            "--token",
            "secret",
        ])
        .unwrap();
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run subcommand");
        };
        let overrides = args.overrides();
        assert_eq!(
            overrides.server_url.as_deref(),
            Some("https://collector.example.com/ws")
        );
        assert_eq!(overrides.auth_token.as_deref(), Some("secret"));
        assert!(!overrides.quiet);
    }

    #[test]
    fn validate_takes_a_config_path() {
        let cli = Cli::try_parse_from(["relay", "validate", "--config", "/tmp/relay.toml"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Validate { config: Some(_) })
        ));
    }
}
