//! tunl - command-line host for the connection orchestrator
//!
//! Loads a configuration file and a server catalog, wires the userspace
//! WireGuard backend, and drives a connection from the terminal.

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunl_core::backend::{UserspaceWireGuard, WireGuardBackend};
use tunl_core::{
    BackendProvider, ConnectIntent, ConnectionHistory, ConnectionManager, LocalCredentialStore,
    ManagerEvent, OrchestratorConfig, ProtocolSelection, ServerCatalog, SessionId, Trigger, VpnProtocol,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "tunl", version, about = "VPN connection orchestrator")]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(long, short, env = "TUNL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Server catalog (TOML or JSON)
    #[arg(long, env = "TUNL_CATALOG", default_value = "servers.toml", global = true)]
    catalog: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and stay connected until Ctrl-C
    Connect(ConnectArgs),
    /// List catalog servers and the protocols they accept
    Status,
    /// Validate the configuration and catalog, then print the effective
    /// configuration
    CheckConfig,
}

#[derive(Args)]
struct ConnectArgs {
    /// Fastest server in a country (e.g. CH)
    #[arg(long, group = "target")]
    country: Option<String>,

    /// Fastest server in a city, as CC/CITY
    #[arg(long, group = "target")]
    city: Option<String>,

    /// A specific server id
    #[arg(long, group = "target")]
    server: Option<String>,

    /// Secure core pair, as ENTRY/EXIT (ENTRY may be empty)
    #[arg(long, group = "target")]
    secure_core: Option<String>,

    /// Dedicated gateway name
    #[arg(long, group = "target")]
    gateway: Option<String>,

    /// Protocol: smart, wireguard, wireguard/tcp, openvpn/udp...
    #[arg(long, short)]
    protocol: Option<ProtocolSelection>,

    /// Session the credential is issued for
    #[arg(long, env = "TUNL_SESSION", default_value = "local")]
    session: String,

    /// Connection history file (JSON lines)
    #[arg(long, env = "TUNL_HISTORY", default_value = "tunl-history.jsonl")]
    history: PathBuf,
}

impl ConnectArgs {
    fn intent(&self) -> anyhow::Result<ConnectIntent> {
        if let Some(country) = &self.country {
            return Ok(ConnectIntent::fastest_in(country));
        }
        if let Some(city) = &self.city {
            let Some((country, city)) = city.split_once('/') else {
                bail!("--city expects CC/CITY, got {}", city);
            };
            return Ok(ConnectIntent::FastestInCity {
                country: country.to_uppercase(),
                city: city.to_string(),
                features: Vec::new(),
            });
        }
        if let Some(server) = &self.server {
            return Ok(ConnectIntent::server(server));
        }
        if let Some(pair) = &self.secure_core {
            let (entry, exit) = pair.split_once('/').unwrap_or(("", pair.as_str()));
            return Ok(ConnectIntent::SecureCore {
                entry_country: (!entry.is_empty()).then(|| entry.to_uppercase()),
                exit_country: exit.to_uppercase(),
            });
        }
        if let Some(name) = &self.gateway {
            return Ok(ConnectIntent::Gateway {
                name: name.clone(),
                server_id: None,
            });
        }
        bail!("one of --country, --city, --server, --secure-core or --gateway is required")
    }
}

#[derive(Serialize)]
struct HistoryLine<'a> {
    intent: &'a ConnectIntent,
    at: u64,
}

/// Appends attempts to a JSON-lines file from a dedicated writer thread
struct JsonLinesHistory {
    lines: mpsc::UnboundedSender<String>,
}

impl JsonLinesHistory {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open history file {}", path.display()))?;
        let (lines, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::task::spawn_blocking(move || {
            while let Some(line) = rx.blocking_recv() {
                if let Err(e) = writeln!(file, "{}", line) {
                    tracing::warn!("History write failed: {}", e);
                }
            }
        });
        Ok(Self { lines })
    }
}

impl ConnectionHistory for JsonLinesHistory {
    fn record_attempt(&self, intent: &ConnectIntent, at: SystemTime) {
        let at = at.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        match serde_json::to_string(&HistoryLine { intent, at }) {
            Ok(line) => {
                let _ = self.lines.send(line);
            }
            Err(e) => tracing::warn!("Cannot serialize history entry: {}", e),
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("cannot load configuration {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_catalog(path: &Path) -> anyhow::Result<ServerCatalog> {
    ServerCatalog::load(path).with_context(|| format!("cannot load server catalog {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunl=info,tunl_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Connect(args) => connect(config, &cli.catalog, args).await,
        Command::Status => status(&cli.catalog),
        Command::CheckConfig => check_config(config, &cli.catalog),
    }
}

async fn connect(config: OrchestratorConfig, catalog: &Path, args: ConnectArgs) -> anyhow::Result<()> {
    let intent = args.intent()?;
    let catalog = load_catalog(catalog)?;
    let config = Arc::new(config);

    let engine = Arc::new(UserspaceWireGuard::new(config.timeouts.handshake()));
    let provider = BackendProvider::new(config.clone())
        .with_backend(Arc::new(WireGuardBackend::new(engine, config.clone())));
    let manager = ConnectionManager::spawn(
        config.clone(),
        provider,
        Arc::new(catalog),
        Arc::new(LocalCredentialStore::default()),
        Arc::new(JsonLinesHistory::open(&args.history)?),
    );
    manager.set_session(Some(SessionId::new(args.session)))?;

    let mut states = manager.subscribe();
    let mut events = manager.events();
    match args.protocol {
        Some(protocol) => manager.connect_with(intent, protocol, Trigger::User("cli".into()))?,
        None => manager.connect(intent, Trigger::User("cli".into()))?,
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, disconnecting");
                break;
            }
            Some(state) = states.recv() => {
                let status = manager.monitor().status();
                match status.params {
                    Some(params) if state.is_connected() => println!("{}: {}", state, params),
                    _ => println!("{}", state),
                }
            }
            Ok(event) = events.recv() => match event {
                ManagerEvent::FallbackStarted { from, server, error, attempt } => {
                    tracing::warn!("Fallback #{} from {} on {}: {}", attempt, from, server, error);
                }
                ManagerEvent::Unreachable { failures } => {
                    tracing::warn!("Tunnel unreachable after {} failed checks", failures);
                }
                ManagerEvent::Surfaced(error) => {
                    tracing::error!("Connection failed: {}", error);
                }
                _ => {}
            },
        }
    }

    let disconnect = manager.disconnect(Trigger::User("ctrl-c".into()));
    if tokio::time::timeout(Duration::from_secs(10), disconnect).await.is_err() {
        tracing::warn!("Disconnect did not finish in time");
    }
    Ok(())
}

fn status(catalog: &Path) -> anyhow::Result<()> {
    let catalog = load_catalog(catalog)?;
    for server in &catalog.servers {
        let protocols: Vec<&str> = VpnProtocol::concrete()
            .iter()
            .filter(|p| server.supports(&ProtocolSelection::of(**p)))
            .map(|p| p.name())
            .collect();
        println!(
            "{:<12} {:<4} load {:>3}% score {:>6.2} {:<8} {}",
            server.name,
            server.exit_country,
            server.load,
            server.score,
            if server.online { "online" } else { "offline" },
            protocols.join(",")
        );
    }
    Ok(())
}

fn check_config(config: OrchestratorConfig, catalog: &Path) -> anyhow::Result<()> {
    let catalog = load_catalog(catalog)?;
    println!("{}", config.to_toml());
    println!("# {} server(s) in catalog", catalog.servers.len());
    Ok(())
}
