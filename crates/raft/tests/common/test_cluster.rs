//! In-memory controller clusters for integration testing

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use fabric_command::{
    ApiError, CodecResult, Command, CommandRegistry, CommandType, MutationContext, TypedCommand,
    cbor_body,
};
use fabric_db::Bucket;
use fabric_mesh::{MemoryHub, MemoryTransport};
use fabric_raft::{
    AddPeerRequest, Controller, ControllerConfig, ControllerResult, RaftSettings,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::info;

pub const WAIT: Duration = Duration::from_secs(15);

/// Register a service address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutService {
    pub name: String,
    pub address: String,
}

impl PutService {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
        }
    }
}

impl Command for PutService {
    fn command_type(&self) -> CommandType {
        Self::TYPE
    }

    fn encode_body(&self) -> CodecResult<Vec<u8>> {
        cbor_body(self)
    }

    fn validate(&self) -> Result<(), ApiError> {
        if self.name.is_empty() {
            return Err(ApiError::field("name", "", "must not be empty"));
        }
        Ok(())
    }

    fn apply(&self, ctx: &mut MutationContext<'_, '_>) -> Result<(), ApiError> {
        // only checked once the command is in the log
        if !self.address.contains(':') {
            return Err(ApiError::field(
                "address",
                self.address.as_str(),
                "must be host:port",
            ));
        }
        ctx.tx()
            .put(Bucket::Root, format!("services/{}", self.name), &self.address)?;
        Ok(())
    }
}

impl TypedCommand for PutService {
    const TYPE: CommandType = 0x0001_0001;
}

/// Remove a registered service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteService {
    pub name: String,
}

impl Command for DeleteService {
    fn command_type(&self) -> CommandType {
        Self::TYPE
    }

    fn encode_body(&self) -> CodecResult<Vec<u8>> {
        cbor_body(self)
    }

    fn apply(&self, ctx: &mut MutationContext<'_, '_>) -> Result<(), ApiError> {
        let key = format!("services/{}", self.name);
        if !ctx.tx().contains(Bucket::Root, &key)? {
            return Err(ApiError::not_found("service", self.name.as_str()));
        }
        ctx.tx().delete(Bucket::Root, &key)?;
        Ok(())
    }
}

impl TypedCommand for DeleteService {
    const TYPE: CommandType = 0x0001_0002;
}

pub fn registry() -> CommandRegistry {
    let mut commands = CommandRegistry::new();
    commands.register::<PutService>().unwrap();
    commands.register::<DeleteService>().unwrap();
    commands
}

pub fn read_service(controller: &Controller, name: &str) -> Option<String> {
    controller
        .view(|tx| {
            let value = tx.get(Bucket::Root, format!("services/{name}"))?;
            Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
        })
        .unwrap()
}

pub fn address(id: &str) -> String {
    format!("{id}:6262")
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Controllers sharing one in-memory mesh
pub struct TestCluster {
    hub: Arc<MemoryHub>,
    dir: TempDir,
    pub nodes: Vec<Controller>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            hub: MemoryHub::new(),
            dir: TempDir::new().unwrap(),
            nodes: Vec::new(),
        }
    }

    /// Configuration with timings tuned for tests
    pub fn config(&self, id: &str) -> ControllerConfig {
        let mut config = ControllerConfig::new(id, address(id), self.dir.path().join(id));
        config.version = "1.4.0".to_string();
        config.bootstrap = false;
        config.bootstrap_timeout = WAIT;
        config.join_retry_interval = Duration::from_millis(200);
        config.raft = RaftSettings {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(200),
            election_timeout_max: Duration::from_millis(400),
            snapshot_interval: Duration::ZERO,
            ..RaftSettings::default()
        };
        config
    }

    pub async fn start(&mut self, config: ControllerConfig) -> ControllerResult<Controller> {
        let transport = Arc::new(MemoryTransport::new(self.hub.clone()));
        let controller = Controller::start(config, transport, registry()).await?;
        self.nodes.push(controller.clone());
        Ok(controller)
    }

    /// Start a member that seeds a new cluster and wait until it leads with
    /// a cluster id assigned
    pub async fn start_leader(&mut self, id: &str) -> Controller {
        let mut config = self.config(id);
        config.bootstrap = true;
        let leader = self.start(config).await.unwrap();

        assert!(
            wait_until(WAIT, || leader.is_leader() && leader.cluster_id().is_some()).await,
            "{id} did not bootstrap"
        );
        info!("{} leads cluster {:?}", id, leader.cluster_id());
        leader
    }

    /// Start a member and have `leader` add it as a voter
    pub async fn start_follower(&mut self, leader: &Controller, id: &str) -> Controller {
        let config = self.config(id);
        self.start_follower_with(leader, config).await
    }

    pub async fn start_follower_with(
        &mut self,
        leader: &Controller,
        config: ControllerConfig,
    ) -> Controller {
        let follower = self.start(config).await.unwrap();

        leader
            .join(AddPeerRequest {
                id: follower.id().to_string(),
                address: address(follower.id()),
                is_voter: true,
            })
            .await
            .unwrap();

        assert!(
            wait_until(WAIT, || {
                follower.leader().as_deref() == Some(leader.id())
                    && follower.applied_index() >= leader.applied_index()
            })
            .await,
            "{} did not catch up with {}",
            follower.id(),
            leader.id()
        );
        follower
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}
