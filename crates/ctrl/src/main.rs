//! Controller binary: runs a member over TCP and sends operator requests.
#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use fabric_command::{CauseRegistry, CommandRegistry};
use fabric_mesh::{Mesh, MeshConfig, Message, TcpOptions, TcpTransport};
use fabric_raft::messages::{
    ADD_PEER_REQUEST, REMOVE_PEER_REQUEST, TRANSFER_LEADERSHIP_REQUEST, decode_reply,
    encode_message,
};
use fabric_raft::{
    AddPeerRequest, ClusterEvent, Controller, ControllerConfig, RemovePeerRequest,
    TransferLeadershipRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Exit status asking the supervisor to start the process again
const EXIT_RESTART: i32 = 75;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading the configuration file failed
    #[error("cannot read {path}: {source}")]
    ReadConfig {
        /// Config file
        path: PathBuf,
        /// Underlying failure
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for a controller
    #[error("invalid config {path}: {source}")]
    ParseConfig {
        /// Config file
        path: PathBuf,
        /// Underlying failure
        source: Box<toml::de::Error>,
    },

    /// Controller failure
    #[error(transparent)]
    Controller(#[from] fabric_raft::Error),

    /// Mesh failure while talking to a controller
    #[error(transparent)]
    Mesh(#[from] fabric_mesh::MeshError),

    /// Installing signal handlers failed
    #[error("signal handler error: {0}")]
    Signal(std::io::Error),
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a controller
    Run(RunArgs),

    /// Add a member, or change the role of an existing one
    AddPeer {
        #[command(flatten)]
        target: TargetArgs,

        /// Member id
        #[arg(long)]
        id: String,

        /// Address the member advertises
        #[arg(long)]
        address: String,

        /// Add the member without a vote
        #[arg(long)]
        non_voter: bool,
    },

    /// Remove a member
    RemovePeer {
        #[command(flatten)]
        target: TargetArgs,

        /// Member id
        #[arg(long)]
        id: String,
    },

    /// Move leadership to another voter
    TransferLeadership {
        #[command(flatten)]
        target: TargetArgs,

        /// Voter to hand leadership to; the most up to date one if omitted
        #[arg(long)]
        to: Option<String>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// TOML configuration file
    #[arg(long, env = "FABRIC_CTRL_CONFIG")]
    config: Option<PathBuf>,

    /// Member id
    #[arg(long, env = "FABRIC_CTRL_ID")]
    id: Option<String>,

    /// Address other members dial
    #[arg(long, env = "FABRIC_CTRL_ADVERTISE_ADDRESS")]
    advertise_address: Option<String>,

    /// Address to bind, when different from the advertise address
    #[arg(long, env = "FABRIC_CTRL_LISTEN_ADDRESS")]
    listen_address: Option<String>,

    /// State directory
    #[arg(long, env = "FABRIC_CTRL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Members to join, comma separated
    #[arg(long, env = "FABRIC_CTRL_INITIAL_MEMBERS", value_delimiter = ',')]
    initial_members: Vec<String>,

    /// Seed a new cluster when the log is empty
    #[arg(long, env = "FABRIC_CTRL_BOOTSTRAP")]
    bootstrap: Option<bool>,
}

#[derive(Debug, Args)]
struct TargetArgs {
    /// Address of a running controller; membership requests must reach the
    /// leader
    #[arg(long, env = "FABRIC_CTRL_ADDRESS", default_value = "127.0.0.1:6262")]
    controller: String,

    /// Seconds to wait for the reply
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

fn load_config(path: &Path) -> Result<ControllerConfig, Error> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| Error::ParseConfig {
        path: path.to_path_buf(),
        source: Box::new(source),
    })
}

fn build_config(args: RunArgs) -> Result<ControllerConfig, Error> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ControllerConfig::default(),
    };

    if let Some(id) = args.id {
        config.id = id;
    }
    if let Some(address) = args.advertise_address {
        config.advertise_address = address;
    }
    if args.listen_address.is_some() {
        config.listen_address = args.listen_address;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if !args.initial_members.is_empty() {
        config.initial_members = args.initial_members;
    }
    if let Some(bootstrap) = args.bootstrap {
        config.bootstrap = bootstrap;
    }
    Ok(config)
}

async fn wait_for_signal(shutdown: CancellationToken) -> Result<(), Error> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).map_err(Error::Signal)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(Error::Signal)?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
            _ = shutdown.cancelled() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(Error::Signal)?;
                info!("received interrupt signal");
            }
            _ = shutdown.cancelled() => {}
        }
    }

    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Error> {
    let config = build_config(args)?;
    let restart_on_restore = config.restart_on_restore;

    let transport = Arc::new(TcpTransport::new(TcpOptions {
        connect_timeout: config.connect_timeout,
        ..TcpOptions::default()
    }));
    let controller = Controller::start(config, transport, CommandRegistry::new()).await?;

    let restart = CancellationToken::new();
    {
        let restart = restart.clone();
        controller.add_event_handler(move |event: &ClusterEvent| match event {
            ClusterEvent::RestartRequired { reason } if restart_on_restore => {
                warn!("restarting: {}", reason);
                restart.cancel();
            }
            ClusterEvent::LeadershipGained => info!("this controller now leads"),
            ClusterEvent::ReadOnly => warn!("cluster is read-only until versions converge"),
            _ => {}
        });
    }

    wait_for_signal(restart.clone()).await?;
    controller.shutdown().await;

    if restart.is_cancelled() {
        std::process::exit(EXIT_RESTART);
    }
    Ok(())
}

/// Send one operator request to the controller at `target.controller`
async fn send_request(target: &TargetArgs, message: Message) -> Result<Option<u64>, Error> {
    let timeout = Duration::from_secs(target.timeout);
    let transport = Arc::new(TcpTransport::new(TcpOptions::default()));
    let mesh = Mesh::start(
        MeshConfig::new(
            format!("ctrl-admin-{}", Uuid::new_v4()),
            "127.0.0.1:0",
            env!("CARGO_PKG_VERSION"),
        ),
        transport,
    )
    .await?;

    let result = async {
        let peer = mesh.get_or_connect(&target.controller, timeout).await?;
        let reply = peer.request(message, timeout).await?;
        Ok::<_, Error>(decode_reply(&reply, &CauseRegistry::default())?)
    }
    .await;

    mesh.shutdown().await;
    result
}

async fn admin(command: Command) -> Result<(), Error> {
    match command {
        Command::Run(_) => Ok(()),
        Command::AddPeer {
            target,
            id,
            address,
            non_voter,
        } => {
            let request = AddPeerRequest {
                id,
                address,
                is_voter: !non_voter,
            };
            send_request(&target, encode_message(ADD_PEER_REQUEST, &request)?).await?;
            info!("added {} at {}", request.id, request.address);
            Ok(())
        }
        Command::RemovePeer { target, id } => {
            let request = RemovePeerRequest { id };
            send_request(&target, encode_message(REMOVE_PEER_REQUEST, &request)?).await?;
            info!("removed {}", request.id);
            Ok(())
        }
        Command::TransferLeadership { target, to } => {
            let request = TransferLeadershipRequest { id: to };
            send_request(
                &target,
                encode_message(TRANSFER_LEADERSHIP_REQUEST, &request)?,
            )
            .await?;
            info!("leadership transferred");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(args).await,
        command => admin(command).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run_args(config: Option<PathBuf>) -> RunArgs {
        RunArgs {
            config,
            id: None,
            advertise_address: None,
            listen_address: None,
            data_dir: None,
            initial_members: Vec::new(),
            bootstrap: None,
        }
    }

    #[test]
    fn test_cli_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ctrl.toml");
        std::fs::write(
            &path,
            r#"
id = "ctrl-a"
advertise_address = "10.0.0.1:6262"
min_cluster_size = 3

[command_handler]
max_queue_size = 10
"#,
        )
        .unwrap();

        let mut args = run_args(Some(path));
        args.advertise_address = Some("10.0.0.9:6262".to_string());
        args.initial_members = vec!["10.0.0.2:6262".to_string(), "10.0.0.3:6262".to_string()];

        let config = build_config(args).unwrap();
        assert_eq!(config.id, "ctrl-a");
        assert_eq!(config.advertise_address, "10.0.0.9:6262");
        assert_eq!(config.min_cluster_size, 3);
        assert_eq!(config.command_handler.max_queue_size, 10);
        assert_eq!(config.initial_members.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ctrl.toml");
        std::fs::write(&path, "min_cluster_size = \"three\"").unwrap();

        let err = build_config(run_args(Some(path))).unwrap_err();
        assert!(matches!(err, Error::ParseConfig { .. }));

        let missing = dir.path().join("missing.toml");
        let err = build_config(run_args(Some(missing))).unwrap_err();
        assert!(matches!(err, Error::ReadConfig { .. }));
    }

    #[test]
    fn test_cli_parses_admin_commands() {
        let cli = Cli::try_parse_from([
            "fabric-ctrl",
            "add-peer",
            "--controller",
            "10.0.0.1:6262",
            "--id",
            "ctrl-d",
            "--address",
            "10.0.0.4:6262",
            "--non-voter",
        ])
        .unwrap();

        match cli.command {
            Command::AddPeer {
                target,
                id,
                non_voter,
                ..
            } => {
                assert_eq!(target.controller, "10.0.0.1:6262");
                assert_eq!(id, "ctrl-d");
                assert!(non_voter);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
