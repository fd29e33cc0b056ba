//! CLI entry point for the ratchet messenger.
//!
//! This binary provides a command-line interface for the messenger library,
//! supporting identity and contact management, configuration, a signaling
//! relay and an interactive chat session.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use ratchet_messenger::{
    crypto::{short_id, IdentityKeyPair, IdentityProvider, Keyring, UserProfile},
    transport::TcpTransportFactory,
    utils::{MessengerConfig, DEFAULT_CONFIG_FILE},
    ContentType, Messenger, PeerEvent, Relay, PROTOCOL_VERSION,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::signal;

/// Ratchet Messenger - End-to-end encrypted peer-to-peer messaging
#[derive(Parser)]
#[command(name = "messenger")]
#[command(about = "A peer-to-peer messenger with per-message ratchet encryption")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for keys and received media
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and manage the identity key
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Manage contact keys
    Contacts {
        #[command(subcommand)]
        action: ContactCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Run a signaling relay
    Relay {
        /// Address to listen on (defaults to the configured relay address)
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Run the messenger interactively
    Run {
        /// Also run a relay on the configured address
        #[arg(long)]
        relay: bool,
        /// Request a chat with this public key on start
        #[arg(long, value_name = "PUBLIC_KEY")]
        chat: Option<String>,
        /// Address peers can reach this host on
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new identity key pair
    Generate {
        /// Display name for the identity
        #[arg(short, long)]
        name: String,
        /// Force overwrite existing keys
        #[arg(short, long)]
        force: bool,
    },
    /// Display the current public key
    Show {
        /// Output format (hex, base64)
        #[arg(short, long, default_value = "hex")]
        format: String,
    },
    /// Export keys for backup
    Export {
        /// Output file for the backup
        #[arg(short, long)]
        output: PathBuf,
        /// Include the private key in the export
        #[arg(long)]
        include_private: bool,
    },
    /// Import keys from backup
    Import {
        /// Input file containing the backup
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[derive(Subcommand)]
enum ContactCommands {
    /// Add a contact by hex public key
    Add {
        /// Hex long-term public key
        public_key: String,
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List contacts
    List,
    /// Remove a contact by id
    Remove {
        /// Contact fingerprint
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = MessengerConfig::load(cli.config.as_deref())?;

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet, &config.logging.level);

    // Override data directory if provided
    if let Some(data_dir) = cli.data_dir {
        config.storage.keys_dir = data_dir.join("keys");
        config.storage.media_dir = data_dir.join("media");
        config.storage.data_dir = data_dir;
    }

    // Ensure directories exist
    config.ensure_directories()?;

    match cli.command {
        Commands::Keys { action } => handle_key_commands(action, &config),
        Commands::Contacts { action } => handle_contact_commands(action, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Relay { listen } => {
            let address = listen.unwrap_or_else(|| config.signaling.relay_address.clone());
            run_relay(&address).await
        }
        Commands::Run { relay, chat, host } => handle_run_command(relay, chat, host, config).await,
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

fn handle_key_commands(action: KeyCommands, config: &MessengerConfig) -> Result<()> {
    let keys_dir = &config.storage.keys_dir;
    match action {
        KeyCommands::Generate { name, force } => {
            if UserProfile::exists(keys_dir) && !force {
                return Err(anyhow!("Identity already exists. Use --force to overwrite."));
            }

            info!("Generating new identity for '{}'", name);
            let profile = UserProfile::new(name);
            profile.save(keys_dir)?;

            println!("✓ Identity generated successfully");
            println!("  Name: {}", profile.identity.display_name);
            println!("  ID: {}", profile.identity.id);
            println!("  Public Key: {}", hex::encode(profile.identity.public_key));
            println!("  Saved to: {}", keys_dir.display());
        }
        KeyCommands::Show { format } => {
            let profile = load_user_profile(config)?;
            let public_key = profile.identity.public_key;

            match format.as_str() {
                "hex" => println!("{}", hex::encode(public_key)),
                "base64" => println!("{}", general_purpose::STANDARD.encode(public_key)),
                _ => return Err(anyhow!("Unsupported format: {}", format)),
            }
        }
        KeyCommands::Export {
            output,
            include_private,
        } => {
            let profile = load_user_profile(config)?;
            let mut export_data = serde_json::json!({
                "identity": profile.identity,
                "exportedAt": chrono::Utc::now(),
                "version": PROTOCOL_VERSION,
            });

            if include_private {
                warn!("Including private key in export - keep this file secure!");
                export_data["privateKey"] = serde_json::json!(general_purpose::STANDARD
                    .encode(profile.export_private_key()));
            }

            std::fs::write(&output, serde_json::to_string_pretty(&export_data)?)?;
            println!("✓ Keys exported to: {}", output.display());
        }
        KeyCommands::Import { input } => {
            let import_data: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(input)?)?;

            let identity = import_data
                .get("identity")
                .cloned()
                .ok_or_else(|| anyhow!("Invalid import file format"))?;
            let identity: ratchet_messenger::Identity = serde_json::from_value(identity)?;
            let private_key = import_data
                .get("privateKey")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| anyhow!("Backup does not contain a private key"))?;

            let keypair =
                IdentityKeyPair::from_secret_bytes(&general_purpose::STANDARD.decode(private_key)?)?;
            let profile = UserProfile::from_keypair_and_identity(keypair, identity)?;
            profile.save(keys_dir)?;
            println!("✓ Keys imported for {}", profile.identity);
        }
    }
    Ok(())
}

fn handle_contact_commands(action: ContactCommands, config: &MessengerConfig) -> Result<()> {
    let mut keyring = Keyring::open(load_user_profile(config)?, &config.storage.keys_dir)?;
    match action {
        ContactCommands::Add { public_key, name } => {
            let public_key = hex::decode(public_key.trim())?;
            let id = match name {
                Some(name) => keyring.add_contact(&public_key, name)?,
                None => keyring.add_peer(&public_key)?,
            };
            println!("✓ Contact added: {id}");
        }
        ContactCommands::List => {
            let mut contacts: Vec<_> = keyring.contacts().collect();
            contacts.sort_by(|a, b| a.display_name.cmp(&b.display_name));
            if contacts.is_empty() {
                println!("No contacts");
            }
            for contact in contacts {
                println!("{}  {}", contact.id, contact.display_name);
            }
        }
        ContactCommands::Remove { id } => {
            if keyring.remove_peer(&id) {
                println!("✓ Contact removed");
            } else {
                return Err(anyhow!("No contact with id {id}"));
            }
        }
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &MessengerConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            MessengerConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = match file {
                Some(path) => MessengerConfig::from_file(path)?,
                None => config.clone(),
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => {
            let config_str = config.to_toml_string()?;

            match section {
                Some(section_name) => {
                    let table: toml::Table = toml::from_str(&config_str)?;
                    let section = table
                        .get(&section_name)
                        .ok_or_else(|| anyhow!("No section '{section_name}'"))?;
                    println!("[{section_name}]");
                    println!("{}", toml::to_string_pretty(section)?);
                }
                None => println!("{config_str}"),
            }
        }
    }
    Ok(())
}

async fn run_relay(address: &str) -> Result<()> {
    let listener = TcpListener::bind(address).await?;
    let relay = Relay::new();

    tokio::select! {
        result = relay.serve(listener) => result?,
        _ = signal::ctrl_c() => info!("Shutting down relay..."),
    }
    Ok(())
}

async fn handle_run_command(
    relay: bool,
    chat: Option<String>,
    host: IpAddr,
    config: MessengerConfig,
) -> Result<()> {
    config.validate()?;

    if relay {
        let listener = TcpListener::bind(&config.signaling.relay_address).await?;
        tokio::spawn(async move {
            if let Err(e) = Relay::new().serve(listener).await {
                error!("Relay stopped: {e}");
            }
        });
    }

    let keyring = Keyring::open(load_user_profile(&config)?, &config.storage.keys_dir)?;
    info!("Starting messenger as {}", keyring.profile().identity);
    let mut messenger =
        Messenger::connect_relay(config, keyring, Arc::new(TcpTransportFactory::new(host)))
            .await?;

    println!("Public key: {}", messenger.public_key());
    println!("Commands: msg <peer> <text> | file <peer> <path> | add <public key> | quit");

    if let Some(public_key) = chat {
        messenger.request_chat(&public_key).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match handle_input(&messenger, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("! {e}"),
                }
            }
            event = messenger.next_event() => {
                let Some(event) = event else { break };
                print_event(&event);
            }
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down gracefully...");
    Ok(())
}

/// Returns false when the session should end
async fn handle_input(messenger: &Messenger, line: &str) -> Result<bool> {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("quit" | "exit"), _, _) => return Ok(false),
        (Some("msg"), Some(peer), Some(text)) => {
            messenger.send_text(peer, text)?;
        }
        (Some("file"), Some(peer), Some(path)) => {
            let path = Path::new(path);
            messenger.send_file(peer, path, content_type_of(path)).await?;
        }
        (Some("add"), Some(public_key), None) => {
            let peer_id = messenger.request_chat(public_key).await?;
            println!("Chat requested with {peer_id}");
        }
        (Some("connect"), Some(peer), None) => messenger.connect(peer)?,
        (Some("disconnect"), Some(peer), None) => messenger.disconnect(peer)?,
        (None | Some(""), _, _) => {}
        _ => println!("Commands: msg <peer> <text> | file <peer> <path> | add <public key> | quit"),
    }
    Ok(true)
}

fn content_type_of(path: &Path) -> ContentType {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp") => ContentType::Image,
        _ => ContentType::File,
    }
}

fn print_event(event: &PeerEvent) {
    match event {
        PeerEvent::Connected { peer_id, .. } => println!("* connected with {peer_id}"),
        PeerEvent::Disconnected { peer_id } => println!("* {peer_id} disconnected"),
        PeerEvent::Message {
            peer_id,
            message,
            file: None,
        } => println!("<{}> {}", short_id(peer_id), message.content),
        PeerEvent::Message {
            peer_id,
            file: Some(path),
            ..
        } => println!("<{}> sent {}", short_id(peer_id), path.display()),
        PeerEvent::ChatRequest { sender_id, .. } => println!("* chat request from {sender_id}"),
        PeerEvent::ChatAccept { sender_id, .. } => println!("* {sender_id} accepted, connecting"),
        PeerEvent::UnknownReceiver { receiver_id, .. } => {
            println!("! {receiver_id} is not on the relay");
        }
        PeerEvent::SendError { error, .. } => println!("! send failed: {error}"),
        PeerEvent::ReceiveError { error, .. } => println!("! receive failed: {error}"),
        PeerEvent::Error { peer_id, error } => println!("! connection with {peer_id} failed: {error}"),
        PeerEvent::Rejected { peer_id, reason } => println!("! rejected {peer_id}: {reason}"),
    }
}

fn load_user_profile(config: &MessengerConfig) -> Result<UserProfile> {
    let keys_dir = &config.storage.keys_dir;

    // Auto-generate profile if it doesn't exist
    if !UserProfile::exists(keys_dir) {
        info!("No identity found, auto-generating new identity...");
        let default_name = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "User".to_string());

        let profile = UserProfile::new(default_name);
        profile.save(keys_dir)?;
        info!("✓ Auto-generated identity: {}", profile.identity);
        return Ok(profile);
    }

    UserProfile::load(keys_dir).map_err(|e| anyhow!("Failed to load identity: {}", e))
}
