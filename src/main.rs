//! elevatr-sync - Self-hosted document store for Elevatr
//!
//! Serves the remote tier that Elevatr clients migrate guest data into and
//! replay their offline changes against.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use elevatr_sync::api;
use elevatr_sync::config::{self, Config};
use elevatr_sync::models::Identity;
use elevatr_sync::sync::SyncService;

#[derive(Parser)]
#[command(name = "elevatr-sync")]
#[command(about = "Self-hosted document store and sync tooling for Elevatr")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the document store server
    Serve {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Generate a new API token
    Token {
        /// Name/label for the token
        #[arg(short, long)]
        name: Option<String>,

        /// List all configured tokens
        #[arg(long)]
        list: bool,

        /// Revoke a token by name
        #[arg(long)]
        revoke: Option<String>,

        /// Config file path (for list/revoke operations)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show a user's pending changes and replay them against the remote store
    Sync {
        /// Remote user id whose queue to replay
        #[arg(short, long)]
        user: String,

        /// Only print the status, do not replay
        #[arg(long)]
        dry_run: bool,

        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Initialize a new config file
    Init {
        /// Output path for config file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let directive: tracing_subscriber::filter::Directive = "elevatr_sync=info"
        .parse()
        .context("Invalid default log directive")?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, bind } => {
            let mut cfg = match config {
                Some(path) => Config::load_from(&path)?,
                None => Config::load()?,
            };

            if let Some(p) = port {
                cfg.server.port = p;
            }
            if let Some(b) = bind {
                cfg.server.bind = b;
            }

            api::run_server(cfg).await
        }

        Commands::Token {
            name,
            list,
            revoke,
            config,
        } => {
            let config_path = match config {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if list {
                return list_tokens(&config_path);
            }
            if let Some(token_name) = revoke {
                return revoke_token(&config_path, &token_name);
            }
            add_token(&config_path, name.unwrap_or_else(|| "default".to_string()))
        }

        Commands::Sync {
            user,
            dry_run,
            config,
        } => {
            let cfg = match config {
                Some(path) => Config::load_from(&path)?,
                None => Config::load()?,
            };
            let service = SyncService::from_config(&cfg).context("Failed to open local stores")?;
            let identity = Identity::remote(user.clone());

            let status = service.get_sync_status(Some(&identity));
            println!("{}", serde_json::to_string_pretty(&status)?);
            if dry_run || status.pending_changes == 0 {
                return Ok(());
            }

            let report = service
                .handle_reconnect(&user)
                .await
                .context("Failed to replay pending changes")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Commands::Init { output } => {
            let path = output.unwrap_or_else(|| PathBuf::from("config.toml"));
            Config::default().save_to(&path)?;

            println!("Created config file: {}", path.display());
            println!();
            println!("Next steps:");
            println!("  1. Generate a token: elevatr-sync token --name my-device");
            println!(
                "  2. Start the server: elevatr-sync serve --config {}",
                path.display()
            );

            Ok(())
        }
    }
}

fn list_tokens(config_path: &std::path::Path) -> Result<()> {
    if !config_path.exists() {
        println!("No config file found at {}", config_path.display());
        println!("Run 'elevatr-sync init' to create one.");
        return Ok(());
    }

    let cfg = Config::load_from(config_path)?;
    if cfg.tokens.is_empty() {
        println!("No tokens configured.");
        println!("Generate one with: elevatr-sync token --name <device-name>");
        return Ok(());
    }

    println!("Configured tokens:");
    println!();
    for token in &cfg.tokens {
        let preview: String = token.token_hash.chars().take(20).collect();
        println!("  {} - {}...", token.name, preview);
    }
    Ok(())
}

fn revoke_token(config_path: &std::path::Path, token_name: &str) -> Result<()> {
    if !config_path.exists() {
        println!("No config file found at {}", config_path.display());
        return Ok(());
    }

    let mut cfg = Config::load_from(config_path)?;
    let original_len = cfg.tokens.len();
    cfg.tokens.retain(|t| t.name != token_name);

    if cfg.tokens.len() == original_len {
        println!("Token '{}' not found.", token_name);
    } else {
        cfg.save_to(config_path)?;
        println!("Revoked token '{}'.", token_name);
    }
    Ok(())
}

fn add_token(config_path: &std::path::Path, label: String) -> Result<()> {
    let token = generate_token();
    let token_hash = config::hash_token(&token)?;

    if config_path.exists() {
        let mut cfg = Config::load_from(config_path)?;
        if cfg.tokens.iter().any(|t| t.name == label) {
            println!(
                "Token '{}' already exists. Use --revoke first to replace it.",
                label
            );
            return Ok(());
        }

        cfg.tokens.push(config::TokenConfig {
            name: label.clone(),
            token_hash,
        });
        cfg.save_to(config_path)?;
        println!("✅ Generated API token for '{}'\n", label);
    } else {
        println!("Generated API token for '{}':\n", label);
        println!("Add this to your server's config.toml:\n");
        println!("  [[tokens]]");
        println!("  name = \"{}\"", label);
        println!("  token_hash = \"{}\"\n", token_hash);
    }

    println!("Token: {}\n", token);
    println!("Point a client at this server with:");
    println!("  [remote]");
    println!("  url = \"http://YOUR_SERVER_IP:3040\"");
    println!("  token = \"{}\"\n", token);
    println!("⚠️  Save this token now - it cannot be retrieved later!");
    Ok(())
}

fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();

    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let token_body: String = bytes
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect();

    format!("els_{}", token_body)
}
