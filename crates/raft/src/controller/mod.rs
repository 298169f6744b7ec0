//! The controller: consensus, state machine and mesh wired together

mod bootstrap;
mod dispatch;
mod handlers;
mod membership;
mod observer;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use fabric_command::{CauseRegistry, CommandRegistry, TypedCommand};
use fabric_db::Tx;
use fabric_mesh::{Mesh, MeshConfig, Transport};
use openraft::RaftMetrics;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::commands::InitClusterIdCommand;
use crate::events::{ClusterEvent, ClusterEventHandler, EventHub};
use crate::fsm::Fsm;
use crate::log_store::LogStore;
use crate::network::{self, MeshNetworkFactory};
use crate::rate_limiter::RateLimiter;
use crate::types::{ControllerRaft, Member, ServersWithIndex};
use crate::{ControllerConfig, ControllerResult, Error, TypeConfig};

const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct ControllerInner {
    config: ControllerConfig,
    raft: ControllerRaft,
    fsm: Arc<Fsm>,
    mesh: Mesh,
    events: Arc<EventHub>,
    rate_limiter: RateLimiter,
    commands: Arc<CommandRegistry>,
    causes: CauseRegistry,
    /// Members gathered by joins until `min_cluster_size` is reached
    pending_bootstrap: Mutex<BTreeMap<String, String>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// A member of the controller cluster.
///
/// Cheap to clone; every clone drives the same member.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.inner.config.id)
            .field("leader", &self.leader())
            .field("applied_index", &self.applied_index())
            .finish()
    }
}

impl Controller {
    /// Start a member with the default cause parsers
    pub async fn start(
        config: ControllerConfig,
        transport: Arc<dyn Transport>,
        commands: CommandRegistry,
    ) -> ControllerResult<Self> {
        Self::start_with_causes(config, transport, commands, CauseRegistry::with_defaults()).await
    }

    /// Start a member.
    ///
    /// Opens the state machine and raft log under `config.data_dir`, starts
    /// the mesh and raft, and spawns the background tasks. With
    /// `config.bootstrap` set a brand new member also seeds the cluster.
    pub async fn start_with_causes(
        config: ControllerConfig,
        transport: Arc<dyn Transport>,
        mut commands: CommandRegistry,
        causes: CauseRegistry,
    ) -> ControllerResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| Error::Config(format!("cannot create data dir: {e}")))?;

        if !commands.contains(InitClusterIdCommand::TYPE) {
            commands.register::<InitClusterIdCommand>()?;
        }
        let commands = Arc::new(commands);

        let events = Arc::new(EventHub::new());
        let fsm = Fsm::open(config.state_machine_path(), commands.clone(), events.clone())?;
        let log_store = LogStore::open(config.log_store_path())?;

        let mesh = Mesh::start(
            MeshConfig {
                id: config.id.clone(),
                advertise_address: config.advertise_address.clone(),
                listen_address: config.listen_address.clone(),
                version: config.version.clone(),
                handshake_timeout: config.connect_timeout,
            },
            transport,
        )
        .await?;

        let raft_config = config.raft.to_openraft("fabric-ctrl")?;
        let network = MeshNetworkFactory::new(mesh.clone(), config.connect_timeout);
        let raft = openraft::Raft::new(
            config.id.clone(),
            raft_config,
            network,
            log_store,
            fsm.clone(),
        )
        .await
        .map_err(|e| Error::Raft(format!("failed to create raft instance: {e}")))?;

        network::register_handlers(&mesh, &raft);

        let inner = Arc::new(ControllerInner {
            rate_limiter: RateLimiter::new(&config.rate_limiter),
            config,
            raft,
            fsm,
            mesh,
            events,
            commands,
            causes,
            pending_bootstrap: Mutex::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        let controller = Self { inner };

        controller.register_handlers();
        controller.spawn_observer();
        controller.spawn_snapshot_timer();
        if controller.inner.config.bootstrap {
            controller.spawn_bootstrap();
        }

        info!(
            "controller {} started at {} (applied index {:?})",
            controller.id(),
            controller.inner.mesh.local_address(),
            controller.applied_index()
        );
        Ok(controller)
    }

    fn downgrade(&self) -> Weak<ControllerInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(inner: &Weak<ControllerInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// This member's id
    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// The configuration the member was started with
    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// The mesh connecting this member to the others
    pub fn mesh(&self) -> &Mesh {
        &self.inner.mesh
    }

    fn metrics(&self) -> RaftMetrics<TypeConfig> {
        self.inner.raft.metrics().borrow().clone()
    }

    /// Whether this member currently leads
    pub fn is_leader(&self) -> bool {
        self.metrics().state.is_leader()
    }

    /// Id of the current leader, if one is known
    pub fn leader(&self) -> Option<String> {
        self.metrics().current_leader
    }

    /// Whether writes are accepted, i.e. all connected members run
    /// compatible versions
    pub fn is_read_write(&self) -> bool {
        !self.inner.mesh.is_read_only()
    }

    /// Id of the logical cluster, once assigned
    pub fn cluster_id(&self) -> Option<String> {
        self.inner.fsm.cluster_id()
    }

    /// Index of the last entry applied to the local state machine
    pub fn applied_index(&self) -> Option<u64> {
        self.inner.fsm.applied_index()
    }

    /// Cluster configuration as persisted by the state machine
    pub fn servers(&self) -> Arc<ServersWithIndex> {
        self.inner.fsm.servers()
    }

    /// Read the local state
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> ControllerResult<T>) -> ControllerResult<T> {
        self.inner.fsm.view(f)
    }

    /// Whether a configuration has ever been committed on this member
    fn is_initialized(&self) -> bool {
        let metrics = self.metrics();
        metrics.membership_config.log_id().is_some() || metrics.last_log_index.is_some()
    }

    /// Address of the current leader as recorded in the configuration
    fn leader_address(&self) -> Option<(String, String)> {
        let metrics = self.metrics();
        let leader = metrics.current_leader?;
        let address = metrics
            .membership_config
            .membership()
            .nodes()
            .find(|(id, _)| **id == leader)
            .map(|(_, node)| node.addr.clone())?;
        Some((leader, address))
    }

    /// Members of the current configuration joined with live mesh state
    pub fn members(&self) -> Vec<Member> {
        let metrics = self.metrics();
        let servers = ServersWithIndex::from_membership(&metrics.membership_config);

        servers
            .servers
            .into_iter()
            .map(|server| {
                let is_leader = metrics.current_leader.as_deref() == Some(server.id.as_str());
                if server.id == self.inner.config.id {
                    return Member {
                        id: server.id,
                        address: server.address,
                        is_voter: server.is_voter,
                        is_leader,
                        version: self.inner.mesh.version().to_string(),
                        is_connected: true,
                    };
                }

                let peer = self.inner.mesh.peer(&server.id);
                Member {
                    version: peer
                        .as_ref()
                        .map(|p| p.version().to_string())
                        .unwrap_or_default(),
                    is_connected: peer.is_some(),
                    id: server.id,
                    address: server.address,
                    is_voter: server.is_voter,
                    is_leader,
                }
            })
            .collect()
    }

    /// Wait until some member is known to lead, for at most `timeout`
    pub async fn wait_for_leader(&self, timeout: Duration) -> ControllerResult<String> {
        let wait = async {
            loop {
                if let Some(leader) = self.leader() {
                    return leader;
                }
                tokio::time::sleep(LEADER_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::timeout("waiting for a leader", timeout))
    }

    /// Deliver cluster events to `handler`.
    ///
    /// A handler added while this member leads immediately sees
    /// [`ClusterEvent::LeadershipGained`].
    pub fn add_event_handler(&self, handler: impl ClusterEventHandler) {
        self.inner.events.add_handler(Arc::new(handler));
    }

    /// Raw event stream
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    /// Stop background tasks, raft and the mesh
    pub async fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        info!("shutting down controller {}", self.id());

        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        if let Err(e) = self.inner.raft.shutdown().await {
            warn!("raft did not shut down cleanly: {:?}", e);
        }
        self.inner.mesh.shutdown().await;
        self.inner.events.shutdown().await;
    }
}
