//! Comzy Tunnel Client
//!
//! A CLI tool for exposing a local HTTP service through the Comzy relay.
//!
//! The client keeps one WebSocket connection open to the relay, registers the
//! local port, and replays every request the relay forwards against
//! `http://localhost:<port>`, shipping each response back over the same
//! connection.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod client;
mod config;
mod error;
mod protocol;

use client::{log_events, SessionExit, SessionTimings, TunnelClient};
use config::{Config, LOGIN_URL};

const DEFAULT_PORT: u16 = 3000;

#[derive(Parser, Debug)]
#[command(name = "comzy")]
#[command(author, version, about = "Secure tunnel to localhost")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Local port to expose (default: 3000)
    #[arg(value_parser = parse_port)]
    port: Option<u16>,

    /// Relay WebSocket URL
    #[arg(short, long, global = true, env = "COMZY_RELAY")]
    relay: Option<String>,

    /// Authentication token (overrides the stored one)
    #[arg(short = 'k', long, global = true, env = "COMZY_TOKEN")]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Login with authentication token
    Login,

    /// Logout and remove stored token
    Logout,

    /// Show current authentication status
    Status,
}

fn parse_port(raw: &str) -> std::result::Result<u16, String> {
    const INVALID: &str = "Invalid port number. Use a port between 1-65535";

    match raw.parse::<u16>() {
        Ok(port) if port >= 1 => Ok(port),
        _ => Err(INVALID.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load()?;

    match cli.command {
        Some(Commands::Login) => run_login(config),
        Some(Commands::Logout) => run_logout(config),
        Some(Commands::Status) => {
            run_status(&config);
            Ok(())
        }
        None => {
            let port = cli.port.unwrap_or(DEFAULT_PORT);
            run_start(port, cli.relay.as_deref(), cli.token, &config).await
        }
    }
}

async fn run_start(
    port: u16,
    cli_relay: Option<&str>,
    cli_token: Option<String>,
    config: &Config,
) -> Result<()> {
    let relay_url = config.relay_url(cli_relay)?;
    let token = cli_token.or_else(|| config.token().map(str::to_string));

    for line in startup_banner(port, token.as_deref()) {
        println!("{}", line);
    }

    let (events_tx, events_rx) = mpsc::channel(64);
    tokio::spawn(log_events(events_rx));

    let client = TunnelClient::new(
        &relay_url,
        config.relay_domain(),
        port,
        token,
        SessionTimings::default(),
        Some(events_tx),
    );

    match client.run(shutdown_signal()).await {
        SessionExit::Interrupted => {
            println!();
            println!("Shutting down tunnel...");
        }
        SessionExit::Expired => {
            println!();
            println!("Anonymous session expired (1 hour limit)");
            println!("Login at: {} for unlimited access", LOGIN_URL);
        }
    }

    Ok(())
}

/// Lines printed before the first connection attempt
fn startup_banner(port: u16, token: Option<&str>) -> Vec<String> {
    let mut lines = Vec::new();

    if token.is_none() {
        lines.push("Running in anonymous mode".to_string());
        lines.push(format!("To avoid connection timeout, login at: {}", LOGIN_URL));
    }

    lines.push(format!("Starting tunnel on localhost:{}", port));
    lines
}

fn run_login(mut config: Config) -> Result<()> {
    println!("To get a token, visit the following URL in your browser:");
    println!();
    println!("  {}", LOGIN_URL);
    println!();

    // Try to open browser
    if open::that(LOGIN_URL).is_err() {
        println!("(Could not open browser automatically)");
        println!();
    }

    print!("Enter your authentication token: ");
    use std::io::{self, Write};
    io::stdout().flush()?;

    let mut token = String::new();
    io::stdin()
        .read_line(&mut token)
        .context("Failed to read token")?;
    let token = token.trim().to_string();

    if token.is_empty() {
        println!("No token provided. Running in anonymous mode.");
        println!("To avoid connection timeout, login at: {}", LOGIN_URL);
        return Ok(());
    }

    config.auth.token = Some(token);
    config.save()?;

    println!("Authentication successful");
    println!("Token saved to {}", Config::config_path()?.display());

    Ok(())
}

fn run_logout(mut config: Config) -> Result<()> {
    if config.token().is_none() {
        println!("No active session found");
        return Ok(());
    }

    config.auth.token = None;
    config.save()?;
    println!("Logged out successfully");

    Ok(())
}

fn run_status(config: &Config) {
    match config.token() {
        Some(token) => {
            println!("Authenticated");
            println!("Token: {}", token_preview(token));
        }
        None => {
            println!("Not authenticated (anonymous mode)");
            println!("Login at: {}", LOGIN_URL);
        }
    }
}

fn token_preview(token: &str) -> String {
    match token.char_indices().nth(8) {
        Some((idx, _)) => format!("{}...", &token[..idx]),
        None => token.to_string(),
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_port() {
        let cli = Cli::try_parse_from(["comzy"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port.unwrap_or(DEFAULT_PORT), 3000);
    }

    #[test]
    fn test_port_argument() {
        let cli = Cli::try_parse_from(["comzy", "8080"]).unwrap();
        assert_eq!(cli.port, Some(8080));
    }

    #[test]
    fn test_invalid_ports_rejected() {
        for raw in ["0", "65536", "http", "-1"] {
            let err = Cli::try_parse_from(["comzy", raw]).unwrap_err();
            assert!(
                err.to_string().contains("Invalid port number")
                    || err.kind() == clap::error::ErrorKind::UnknownArgument
                    || err.kind() == clap::error::ErrorKind::InvalidSubcommand,
                "{}: {}",
                raw,
                err
            );
        }
    }

    #[test]
    fn test_subcommands() {
        let cli = Cli::try_parse_from(["comzy", "login"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Login)));
        let cli = Cli::try_parse_from(["comzy", "logout"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Logout)));
        let cli = Cli::try_parse_from(["comzy", "status"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Status)));
    }

    #[test]
    fn test_startup_banner_anonymous() {
        let banner = startup_banner(3000, None);
        assert_eq!(
            banner,
            vec![
                "Running in anonymous mode".to_string(),
                format!("To avoid connection timeout, login at: {}", LOGIN_URL),
                "Starting tunnel on localhost:3000".to_string(),
            ]
        );
    }

    #[test]
    fn test_startup_banner_authenticated() {
        let banner = startup_banner(8080, Some("tok_abc"));
        assert_eq!(banner, vec!["Starting tunnel on localhost:8080".to_string()]);
    }

    #[test]
    fn test_token_preview() {
        assert_eq!(token_preview("tok_0123456789"), "tok_0123...");
        assert_eq!(token_preview("short"), "short");
    }
}
