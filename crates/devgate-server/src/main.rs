//! devgate: real-time device gateway, entry point.
//!
//! Remote sessions connect over WebSocket, authenticate with a JWT, and
//! share the serial-attached devices of this machine.
//!
//! # Usage
//!
//! ```text
//! devgate [OPTIONS]
//!
//! Options:
//!   --config <PATH>        Config file [default: platform config directory]
//!   --port <PORT>          Listen port (overrides the file)
//!   --bind <ADDR>          Listen address (overrides the file)
//!   --allow-remote         Accept sessions from any origin address
//!   --secret <SECRET>      JWT signing secret (overrides the file)
//!   --init-config          Write the default configuration and exit
//!   --issue-token <NAME>   Print a signed token for NAME and exit
//!   --token-ttl <SECS>     Lifetime of the issued token [default: no expiry]
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable               | Flag             |
//! |------------------------|------------------|
//! | `DEVGATE_CONFIG`       | `--config`       |
//! | `DEVGATE_PORT`         | `--port`         |
//! | `DEVGATE_BIND`         | `--bind`         |
//! | `DEVGATE_ALLOW_REMOTE` | `--allow-remote` |
//! | `DEVGATE_SECRET`       | `--secret`       |
//!
//! CLI values win over the config file.  `RUST_LOG` wins over the
//! configured log level.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use devgate_server::application::access_gate::Identity;
use devgate_server::infrastructure::auth::{issue_token, JwtValidator};
use devgate_server::infrastructure::devices::{SerialControllerFactory, SerialPortScanner};
use devgate_server::infrastructure::jobs::ProcessJobExecutor;
use devgate_server::infrastructure::storage::config::{
    config_file_path, load_config, save_config, GatewayConfig,
};
use devgate_server::infrastructure::ws_server::{run_server, SessionSettings};
use devgate_server::{Gateway, GatewayParts};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Real-time gateway sharing serial devices between remote sessions.
#[derive(Debug, Parser)]
#[command(name = "devgate", version)]
struct Cli {
    /// Path of the TOML configuration file.
    #[arg(long, env = "DEVGATE_CONFIG")]
    config: Option<PathBuf>,

    /// TCP port to listen on.
    #[arg(long, env = "DEVGATE_PORT")]
    port: Option<u16>,

    /// IP address to bind to.
    ///
    /// `0.0.0.0` accepts connections on every interface; the origin
    /// allow-list still applies.
    #[arg(long, env = "DEVGATE_BIND")]
    bind: Option<String>,

    /// Accept sessions from origin addresses outside the allowed ranges.
    #[arg(long, env = "DEVGATE_ALLOW_REMOTE")]
    allow_remote: bool,

    /// Secret used to verify (and issue) access tokens.
    #[arg(long, env = "DEVGATE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Write the default configuration file and exit.
    #[arg(long)]
    init_config: bool,

    /// Print a signed access token for this name and exit.
    #[arg(long, value_name = "NAME")]
    issue_token: Option<String>,

    /// Lifetime of the token printed by `--issue-token`, in seconds.
    #[arg(long, value_name = "SECS", requires = "issue_token")]
    token_ttl: Option<u64>,
}

impl Cli {
    /// Applies the command-line overrides on top of the file configuration.
    fn apply_to(&self, config: &mut GatewayConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = &self.bind {
            config.server.bind_address = bind.clone();
        }
        if self.allow_remote {
            config.access.allow_remote_access = true;
        }
        if let Some(secret) = &self.secret {
            config.access.secret = secret.clone();
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.init_config {
        return init_config(cli.config.clone());
    }

    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply_to(&mut config);

    // ── Logging setup ─────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    if let Some(name) = &cli.issue_token {
        anyhow::ensure!(
            !config.access.secret.trim().is_empty(),
            "a secret is required to issue tokens (set access.secret or --secret)"
        );
        let identity = Identity {
            id: Some(Uuid::new_v4().to_string()),
            name: Some(name.clone()),
        };
        let ttl = cli.token_ttl.map(Duration::from_secs);
        let token = issue_token(&config.access.secret, &identity, ttl)
            .context("failed to sign token")?;
        println!("{token}");
        return Ok(());
    }

    config.validate().context("invalid configuration")?;
    let addr = config.listen_addr()?;

    // ── Assemble the gateway ──────────────────────────────────────────────────
    let gateway = Gateway::new(GatewayParts {
        factory: Arc::new(SerialControllerFactory),
        executor: Arc::new(ProcessJobExecutor::new(
            config.jobs.program.clone(),
            config.jobs.args.clone(),
        )),
        scanner: Arc::new(SerialPortScanner::new(config.devices.clone())),
        validator: Arc::new(JwtValidator::new(&config.access.secret)),
        origin_policy: config.origin_policy()?,
        controller_defaults: config.controller_settings(),
        virtual_ports: config.ports.clone(),
    });
    gateway.start();

    info!(
        %addr,
        allow_remote = config.access.allow_remote_access,
        "devgate starting"
    );

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    let served = run_server(
        addr,
        Arc::clone(&gateway),
        SessionSettings::from_config(&config),
        running,
    )
    .await;
    gateway.shutdown().await;
    served?;

    info!("devgate stopped");
    Ok(())
}

/// Writes a default configuration with a fresh random secret.
fn init_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = match path {
        Some(path) => path,
        None => config_file_path()?,
    };
    anyhow::ensure!(
        !path.exists(),
        "{} already exists; remove it first",
        path.display()
    );
    let mut config = GatewayConfig::default();
    config.access.secret = Uuid::new_v4().simple().to_string();
    save_config(&config, &path)?;
    println!("wrote default configuration to {}", path.display());
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_without_flags_keeps_file_values() {
        // Arrange
        let cli = Cli::parse_from(["devgate"]);
        let mut config = GatewayConfig::default();
        config.access.secret = "from-file".to_string();

        // Act
        cli.apply_to(&mut config);

        // Assert
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert!(!config.access.allow_remote_access);
        assert_eq!(config.access.secret, "from-file");
    }

    #[test]
    fn test_cli_overrides_win_over_file() {
        let cli = Cli::parse_from([
            "devgate",
            "--port",
            "9100",
            "--bind",
            "127.0.0.1",
            "--allow-remote",
            "--secret",
            "s3cret",
        ]);
        let mut config = GatewayConfig::default();

        cli.apply_to(&mut config);

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert!(config.access.allow_remote_access);
        assert_eq!(config.access.secret, "s3cret");
    }

    #[test]
    fn test_token_ttl_requires_issue_token() {
        assert!(Cli::try_parse_from(["devgate", "--token-ttl", "60"]).is_err());
        let cli = Cli::try_parse_from(["devgate", "--issue-token", "ui", "--token-ttl", "60"]).unwrap();
        assert_eq!(cli.issue_token.as_deref(), Some("ui"));
        assert_eq!(cli.token_ttl, Some(60));
    }

    #[test]
    fn test_init_config_writes_loadable_file_with_secret() {
        let dir = std::env::temp_dir().join(format!("devgate_init_{}", Uuid::new_v4()));
        let path = dir.join("config.toml");

        init_config(Some(path.clone())).unwrap();
        let loaded = load_config(Some(&path)).unwrap();

        assert!(loaded.validate().is_ok());
        assert!(init_config(Some(path)).is_err(), "existing file must not be overwritten");
        std::fs::remove_dir_all(&dir).ok();
    }
}
