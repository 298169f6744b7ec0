//! Raft RPCs carried over the mesh

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use fabric_mesh::{ContentType, Mesh, Message};
use futures::FutureExt;
use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::messages::{
    RAFT_APPEND_ENTRIES, RAFT_INSTALL_SNAPSHOT, RAFT_RESPONSE, RAFT_VOTE, decode_body,
    encode_message, error_response,
};
use crate::types::ControllerRaft;
use crate::{Error, TypeConfig};

/// Creates one [`MeshRaftClient`] per replication target
#[derive(Debug, Clone)]
pub(crate) struct MeshNetworkFactory {
    mesh: Mesh,
    connect_timeout: Duration,
}

impl MeshNetworkFactory {
    pub(crate) fn new(mesh: Mesh, connect_timeout: Duration) -> Self {
        Self {
            mesh,
            connect_timeout,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for MeshNetworkFactory {
    type Network = MeshRaftClient;

    async fn new_client(&mut self, target: String, node: &BasicNode) -> Self::Network {
        MeshRaftClient {
            mesh: self.mesh.clone(),
            target,
            address: node.addr.clone(),
            connect_timeout: self.connect_timeout,
        }
    }
}

/// Sends raft RPCs to a single member
#[derive(Debug)]
pub(crate) struct MeshRaftClient {
    mesh: Mesh,
    target: String,
    address: String,
    connect_timeout: Duration,
}

impl MeshRaftClient {
    async fn send<Req, Resp, E>(
        &self,
        content_type: ContentType,
        rpc: &Req,
        option: RPCOption,
    ) -> Result<Resp, RPCError<TypeConfig, E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: StdError + DeserializeOwned,
    {
        let message = encode_message(content_type, rpc).map_err(|e| network_err(&e))?;

        let peer = self
            .mesh
            .get_or_connect(&self.address, self.connect_timeout)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;

        let reply = peer
            .request(message, option.hard_ttl())
            .await
            .map_err(|e| network_err(&e))?;

        if reply.content_type != RAFT_RESPONSE {
            return Err(network_err(&io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unexpected reply of message type {} from {}: {}",
                    reply.content_type,
                    self.target,
                    reply.body_text()
                ),
            )));
        }

        let result: Result<Resp, E> = decode_body(&reply).map_err(|e| network_err(&e))?;
        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target.clone(), e)))
    }
}

impl RaftNetwork<TypeConfig> for MeshRaftClient {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<TypeConfig>, RPCError<TypeConfig, RaftError<TypeConfig>>> {
        self.send(RAFT_APPEND_ENTRIES, &rpc, option).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<TypeConfig>,
        RPCError<TypeConfig, RaftError<TypeConfig, InstallSnapshotError>>,
    > {
        self.send(RAFT_INSTALL_SNAPSHOT, &rpc, option).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<VoteResponse<TypeConfig>, RPCError<TypeConfig, RaftError<TypeConfig>>> {
        self.send(RAFT_VOTE, &rpc, option).await
    }
}

fn network_err<E: StdError + 'static, RE: StdError>(e: &E) -> RPCError<TypeConfig, RE> {
    RPCError::Network(NetworkError::new(e))
}

/// Serve inbound raft RPCs from the mesh
pub(crate) fn register_handlers(mesh: &Mesh, raft: &ControllerRaft) {
    {
        let raft = raft.clone();
        mesh.handle(RAFT_VOTE, move |peer, message| {
            let raft = raft.clone();
            async move {
                match decode_body::<VoteRequest<TypeConfig>>(&message) {
                    Ok(rpc) => raft_reply(raft.vote(rpc).await),
                    Err(e) => reject(peer.id(), &e),
                }
            }
            .boxed()
        });
    }

    {
        let raft = raft.clone();
        mesh.handle(RAFT_APPEND_ENTRIES, move |peer, message| {
            let raft = raft.clone();
            async move {
                match decode_body::<AppendEntriesRequest<TypeConfig>>(&message) {
                    Ok(rpc) => raft_reply(raft.append_entries(rpc).await),
                    Err(e) => reject(peer.id(), &e),
                }
            }
            .boxed()
        });
    }

    {
        let raft = raft.clone();
        mesh.handle(RAFT_INSTALL_SNAPSHOT, move |peer, message| {
            let raft = raft.clone();
            async move {
                match decode_body::<InstallSnapshotRequest<TypeConfig>>(&message) {
                    Ok(rpc) => raft_reply(raft.install_snapshot(rpc).await),
                    Err(e) => reject(peer.id(), &e),
                }
            }
            .boxed()
        });
    }
}

fn raft_reply<T: Serialize, E: Serialize + std::fmt::Debug>(result: Result<T, E>) -> Message {
    if let Err(e) = &result {
        debug!("raft rpc failed: {:?}", e);
    }
    match encode_message(RAFT_RESPONSE, &result) {
        Ok(reply) => reply,
        Err(e) => error_response(&e),
    }
}

fn reject(peer: &str, e: &Error) -> Message {
    warn!("malformed raft rpc from {}: {}", peer, e);
    error_response(e)
}
