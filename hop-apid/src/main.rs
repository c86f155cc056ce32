//! hop-api daemon and client
//!
//! `hop-apid serve` runs the control API in front of the tunnel program.
//! The other subcommands manage the allow-list or talk to a running daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use hop_api::{
    AllowList, ApiClient, ApiServer, ApiService, AuthorizationGuard, AuthorizationStore, Config,
    EngineHandle, EngineSlot, IdentityResolver, Intent, MemoryProfileStore, ProcessEngine,
    StatusUpdate, SystemIdentityResolver, DEFAULT_SOCKET_PATH,
};

/// Authorization-gated control API for the hop VPN client
#[derive(Parser)]
#[command(name = "hop-apid")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "hop-api.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace); defaults to api.log_level
    #[arg(short, long)]
    log_level: Option<String>,

    /// API socket to connect to, overriding the configuration
    #[arg(short, long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API daemon
    Serve,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "hop-api.toml")]
        output: PathBuf,
    },

    /// Allow an account to use the API
    Allow { name: String },

    /// Remove an account from the allow-list
    Revoke { name: String },

    /// Show the allow-list
    Allowed,

    /// List profiles
    List,

    /// Add a profile from a tunnel configuration file
    Add {
        name: String,
        file: PathBuf,

        /// Mark the profile as not editable by the user
        #[arg(long)]
        locked: bool,
    },

    /// Remove a profile
    Remove { uuid: Uuid },

    /// Start a stored profile
    Start { uuid: Uuid },

    /// Start a tunnel configuration file without storing it
    StartConfig { name: String, file: PathBuf },

    /// Stop the tunnel
    Stop,

    /// Pause the tunnel
    Pause,

    /// Resume a paused tunnel
    Resume,

    /// Show the current status
    Status,

    /// Print status updates until interrupted
    Watch,

    /// Check whether an account still needs to be approved
    Approved { name: String },

    /// Check whether tunnel rights still have to be granted
    Permission,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| Config::load(&cli.config).ok().map(|c| c.api.log_level))
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match &cli.command {
        Commands::Serve => run_daemon(&cli.config).await,
        Commands::GenConfig { output } => generate_config(output),
        Commands::Allow { name } => allow(&cli.config, name),
        Commands::Revoke { name } => revoke(&cli.config, name),
        Commands::Allowed => show_allowed(&cli.config),
        command => run_client(&cli, command).await,
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load configuration from {:?}", path))
}

async fn run_daemon(config_path: &Path) -> Result<()> {
    info!("Starting hop-api daemon...");

    let config = load_config(config_path)?;
    info!("Configuration loaded from {:?}", config_path);

    let allow_list = AllowList::load(&config.api.allow_list)
        .with_context(|| format!("Failed to load allow-list {:?}", config.api.allow_list))?;
    let guard = AuthorizationGuard::new(Arc::new(allow_list), Arc::new(SystemIdentityResolver));

    let slot = Arc::new(EngineSlot::new());
    let service = Arc::new(ApiService::new(
        guard,
        Arc::new(MemoryProfileStore::new()),
        slot.clone(),
        config.api.delivery_timeout(),
    ));

    // The slot only holds a weak reference; this binding keeps the engine alive
    let engine: Arc<dyn EngineHandle> =
        Arc::new(ProcessEngine::new(config.engine.clone(), service.clone()));
    slot.bind(&engine);

    let server =
        ApiServer::bind(&config.api.socket, service.clone()).context("Failed to start API server")?;

    tokio::select! {
        result = server.run() => result.context("API server failed")?,
        result = wait_for_shutdown() => result?,
    }

    info!("Shutting down...");
    engine.stop().await;
    service.shutdown();

    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nAllow API callers with `hop-apid allow <account>` before starting the daemon.");

    Ok(())
}

fn open_allow_list(config_path: &Path) -> Result<AllowList> {
    let config = load_config(config_path)?;
    AllowList::load(&config.api.allow_list)
        .with_context(|| format!("Failed to load allow-list {:?}", config.api.allow_list))
}

fn allow(config_path: &Path, name: &str) -> Result<()> {
    if SystemIdentityResolver.resolve(name).is_none() {
        bail!("No such account: {}", name);
    }

    let allow_list = open_allow_list(config_path)?;
    allow_list
        .allow(name)
        .with_context(|| format!("Failed to allow {}", name))?;
    println!("{} may now use the API", name);
    Ok(())
}

fn revoke(config_path: &Path, name: &str) -> Result<()> {
    let allow_list = open_allow_list(config_path)?;
    if !allow_list.is_allowed(name) {
        println!("{} is not on the allow-list", name);
        return Ok(());
    }
    allow_list
        .remove(name)
        .with_context(|| format!("Failed to revoke {}", name))?;
    println!("{} may no longer use the API", name);
    Ok(())
}

fn show_allowed(config_path: &Path) -> Result<()> {
    let allow_list = open_allow_list(config_path)?;
    let entries = allow_list.entries();
    if entries.is_empty() {
        println!("No accounts are allowed");
    }
    for name in entries {
        println!("{}", name);
    }
    Ok(())
}

fn client_socket(cli: &Cli) -> PathBuf {
    if let Some(socket) = &cli.socket {
        return socket.clone();
    }
    match Config::load(&cli.config) {
        Ok(config) => config.api.socket,
        Err(_) => PathBuf::from(DEFAULT_SOCKET_PATH),
    }
}

fn read_config_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
}

async fn run_client(cli: &Cli, command: &Commands) -> Result<()> {
    let mut client = ApiClient::connect(client_socket(cli)).await?;

    match command {
        Commands::List => {
            let profiles = client.list_profiles().await?;
            if profiles.is_empty() {
                println!("No profiles");
            }
            for profile in profiles {
                println!(
                    "{}  {}  (creator: {}, {})",
                    profile.uuid,
                    profile.name,
                    profile.creator.as_deref().unwrap_or("-"),
                    if profile.user_editable { "editable" } else { "locked" }
                );
            }
        }
        Commands::Add { name, file, locked } => {
            let config = read_config_file(file)?;
            match client.add_profile_detailed(name, !locked, &config).await? {
                Some(profile) => println!("Added profile {} ({})", profile.name, profile.uuid),
                None => bail!("The daemon rejected the configuration in {:?}", file),
            }
        }
        Commands::Remove { uuid } => {
            client.remove_profile(*uuid).await?;
            println!("Removed {}", uuid);
        }
        Commands::Start { uuid } => {
            let intent = client.start_profile(*uuid).await?;
            print_intent(intent, "Starting");
        }
        Commands::StartConfig { name, file } => {
            let config = read_config_file(file)?;
            let intent = client.start_inline_config(name, &config).await?;
            print_intent(intent, "Starting");
        }
        Commands::Stop => client.stop().await?,
        Commands::Pause => client.pause().await?,
        Commands::Resume => client.resume().await?,
        Commands::Status => {
            let (status, active) = client.status().await?;
            print_status(&status);
            if active {
                println!("Tunnel is connected or connecting");
            }
        }
        Commands::Watch => {
            client.register_observer().await?;
            let shutdown = wait_for_shutdown();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    update = client.next_update() => print_status(&update?),
                    result = &mut shutdown => {
                        result?;
                        break;
                    }
                }
            }
        }
        Commands::Approved { name } => {
            let intent = client.check_pre_approved(name).await?;
            print_intent(intent, "Approved");
        }
        Commands::Permission => {
            let intent = client.check_tunnel_permission().await?;
            print_intent(intent, "Granted");
        }
        Commands::Serve
        | Commands::GenConfig { .. }
        | Commands::Allow { .. }
        | Commands::Revoke { .. }
        | Commands::Allowed => bail!("Not a client command"),
    }

    Ok(())
}

fn print_status(status: &StatusUpdate) {
    let profile = status
        .vpn_uuid
        .map(|uuid| uuid.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("{} [{}] {} (profile {})", status.state, status.level, status.message, profile);
}

fn print_intent(intent: Option<Intent>, done: &str) {
    match intent {
        None => println!("{}", done),
        Some(Intent::ConfirmApi) => {
            println!("Needs approval: run `hop-apid allow <account>` as root")
        }
        Some(Intent::GrantTunnelPermission) => {
            println!("Needs tunnel rights: the daemon must run as root")
        }
        Some(Intent::LaunchProfile { uuid, .. }) => {
            println!("Profile {} needs interactive confirmation before it can start", uuid)
        }
    }
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to register SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
    Ok(())
}
