//! CLI binary for rendering and applying cross-connect configurations.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;

use xconnect_chain::{Device, Forwarder, ForwarderConfig, HttpDevice, LocalDownstream, RecordingDevice};
use xconnect_types::{Connection, ConnectionRequest};

#[derive(Parser)]
#[command(name = "xconnect", version, about = "Cross-connect forwarder configuration assembly")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    forwarder: ForwarderArgs,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args)]
struct ForwarderArgs {
    /// Forwarder name used in logs
    #[arg(long, global = true, env = "XCONNECT_NAME", default_value = "xconnect")]
    name: String,

    /// Directory under which memif sockets are created
    #[arg(
        long,
        global = true,
        env = "XCONNECT_BASE_DIR",
        default_value = "/var/lib/xconnect/memif"
    )]
    base_dir: PathBuf,

    /// Local VXLAN tunnel endpoint address
    #[arg(long, global = true, env = "XCONNECT_TUNNEL_IP", default_value = "127.0.0.1")]
    tunnel_ip: IpAddr,

    /// Base URL of the dataplane agent (e.g. http://127.0.0.1:9191)
    #[arg(long, global = true, env = "XCONNECT_DEVICE_URL")]
    device_url: Option<String>,
}

impl ForwarderArgs {
    fn to_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            name: self.name.clone(),
            base_dir: self.base_dir.clone(),
            tunnel_ip: self.tunnel_ip,
            device_url: self.device_url.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run Establish against a dry-run device and print the committed document
    Render {
        /// Path to a connection request (JSON)
        request: PathBuf,
    },

    /// Run Establish against the device and print the resulting connection
    Apply {
        /// Path to a connection request (JSON)
        request: PathBuf,
    },

    /// Run Teardown against the device for a previously applied connection
    Teardown {
        /// Path to a connection returned by `apply` (JSON)
        connection: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.forwarder.to_config();
    match cli.command {
        Commands::Render { request } => cmd_render(&config, &request).await?,
        Commands::Apply { request } => cmd_apply(&config, &request).await?,
        Commands::Teardown { connection } => cmd_teardown(&config, &connection).await?,
    }

    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&source).with_context(|| format!("parsing {}", path.display()))
}

/// Load a request, giving it a fresh identifier if it has none.
fn load_request(path: &Path) -> anyhow::Result<ConnectionRequest> {
    let mut request: ConnectionRequest = read_json(path)?;
    if request.connection.id.is_empty() {
        request.connection.id = uuid::Uuid::new_v4().to_string();
        tracing::info!(connection = %request.connection.id, "Assigned connection id");
    }
    Ok(request)
}

fn http_device(config: &ForwarderConfig) -> anyhow::Result<Arc<dyn Device>> {
    let url = config
        .device_url
        .as_deref()
        .context("--device-url (or XCONNECT_DEVICE_URL) is required")?;
    Ok(Arc::new(HttpDevice::new(url)?))
}

async fn cmd_render(config: &ForwarderConfig, path: &Path) -> anyhow::Result<()> {
    let request = load_request(path)?;
    let device = Arc::new(RecordingDevice::new());
    let forwarder = Forwarder::new(config, device.clone(), Arc::new(LocalDownstream));

    forwarder.establish(request).await?;

    let (op, document) = device
        .last()
        .await
        .context("pipeline finished without committing")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "op": op, "config": document }))?
    );
    Ok(())
}

async fn cmd_apply(config: &ForwarderConfig, path: &Path) -> anyhow::Result<()> {
    let request = load_request(path)?;
    let forwarder = Forwarder::new(config, http_device(config)?, Arc::new(LocalDownstream));

    let connection = forwarder.establish(request).await?;
    println!("{}", serde_json::to_string_pretty(&connection)?);
    Ok(())
}

async fn cmd_teardown(config: &ForwarderConfig, path: &Path) -> anyhow::Result<()> {
    let connection: Connection = read_json(path)?;
    let forwarder = Forwarder::new(config, http_device(config)?, Arc::new(LocalDownstream));

    forwarder.teardown(&connection).await?;
    println!("Connection {} closed", connection.id);
    Ok(())
}
