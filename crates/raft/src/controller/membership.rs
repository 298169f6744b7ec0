//! Membership changes: join, add and remove peers, leadership transfer

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use fabric_command::ApiError;
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{BasicNode, ChangeMembers};
use tracing::{debug, info, warn};

use super::Controller;
use super::dispatch::write_error;
use crate::messages::{
    ADD_PEER_REQUEST, AddPeerRequest, REMOVE_PEER_REQUEST, RemovePeerRequest,
    TRANSFER_LEADERSHIP_REQUEST, TransferLeadershipRequest, encode_message,
};
use crate::types::ServersWithIndex;
use crate::{ControllerResult, Error, TypeConfig};

type ClientWriteFailure = RaftError<TypeConfig, ClientWriteError<TypeConfig>>;

const TRANSFER_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl Controller {
    /// Ask to join the cluster.
    ///
    /// Before the cluster exists, joins are collected until
    /// `min_cluster_size` members are known, at which point this member
    /// seeds the cluster with all of them. Afterwards a join is an
    /// [`add_peer`](Self::add_peer).
    pub async fn join(&self, request: AddPeerRequest) -> ControllerResult<()> {
        validate_peer(&request)?;

        if self.is_initialized() {
            return self.add_peer(request).await;
        }

        let members = {
            let mut pending = self.inner.pending_bootstrap.lock();
            pending.insert(
                self.inner.config.id.clone(),
                self.inner.config.advertise_address.clone(),
            );
            pending.insert(request.id.clone(), request.address.clone());

            if pending.len() < self.inner.config.min_cluster_size {
                info!(
                    "{} joined, waiting for {} of {} members before bootstrapping",
                    request.id,
                    pending.len(),
                    self.inner.config.min_cluster_size
                );
                return Ok(());
            }
            pending.clone()
        };

        self.initialize_cluster(members).await
    }

    /// Seed a brand new cluster with `members` as voters
    pub(super) async fn initialize_cluster(
        &self,
        members: BTreeMap<String, String>,
    ) -> ControllerResult<()> {
        info!("bootstrapping cluster with members {:?}", members.keys());
        let nodes: BTreeMap<String, BasicNode> = members
            .into_iter()
            .map(|(id, address)| (id, BasicNode::new(address)))
            .collect();

        match self.inner.raft.initialize(nodes).await {
            Ok(()) => {}
            Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                debug!("cluster already initialized: {}", e);
            }
            Err(e) => return Err(Error::Raft(format!("failed to bootstrap cluster: {e}"))),
        }

        self.spawn_finish_bootstrap();
        Ok(())
    }

    /// Add a member, or update an existing one.
    ///
    /// Followers forward the request to the leader.
    pub async fn add_peer(&self, request: AddPeerRequest) -> ControllerResult<()> {
        validate_peer(&request)?;
        if !self.is_leader() {
            self.send_to_leader(encode_message(ADD_PEER_REQUEST, &request)?)
                .await?;
            return Ok(());
        }
        self.add_peer_local(request).await
    }

    pub(super) async fn add_peer_local(&self, request: AddPeerRequest) -> ControllerResult<()> {
        validate_peer(&request)?;
        self.require_leader()?;

        let raft = &self.inner.raft;
        let servers = ServersWithIndex::from_membership(&self.metrics().membership_config);

        let existing = servers
            .servers
            .iter()
            .find(|s| s.id == request.id && s.address == request.address);
        if let Some(existing) = existing {
            if existing.is_voter == request.is_voter {
                debug!("{} is already a member at {}", request.id, request.address);
                return Ok(());
            }

            let ids = BTreeSet::from([request.id.clone()]);
            if request.is_voter {
                info!("promoting {} to voter", request.id);
                self.bounded_change(
                    format!("promoting {}", request.id),
                    raft.change_membership(ChangeMembers::AddVoterIds(ids), true),
                )
                .await?;
            } else {
                info!("demoting {} to non-voter", request.id);
                self.bounded_change(
                    format!("demoting {}", request.id),
                    raft.change_membership(ChangeMembers::RemoveVoters(ids), true),
                )
                .await?;
            }
            return Ok(());
        }

        // an id or address may only appear once
        for conflict in servers
            .servers
            .iter()
            .filter(|s| s.id == request.id || s.address == request.address)
        {
            if conflict.id == self.inner.config.id {
                return Err(Error::Api(ApiError::invalid(format!(
                    "{} at {} conflicts with the leader",
                    request.id, request.address
                ))));
            }

            warn!(
                "removing {} at {} which conflicts with joining {} at {}",
                conflict.id, conflict.address, request.id, request.address
            );
            let ids = BTreeSet::from([conflict.id.clone()]);
            let change = if conflict.is_voter {
                ChangeMembers::RemoveVoters(ids)
            } else {
                ChangeMembers::RemoveNodes(ids)
            };
            self.bounded_change(
                format!("removing conflicting {}", conflict.id),
                raft.change_membership(change, false),
            )
            .await?;
        }

        info!(
            "adding {} at {} as {}",
            request.id,
            request.address,
            if request.is_voter { "voter" } else { "non-voter" }
        );
        // blocks until the learner has caught up
        self.bounded_change(
            format!("adding {} at {}", request.id, request.address),
            raft.add_learner(
                request.id.clone(),
                BasicNode::new(request.address.clone()),
                true,
            ),
        )
        .await?;

        if request.is_voter {
            self.bounded_change(
                format!("promoting {}", request.id),
                raft.change_membership(
                    ChangeMembers::AddVoterIds(BTreeSet::from([request.id.clone()])),
                    true,
                ),
            )
            .await?;
        }
        Ok(())
    }

    /// Remove member `id` from the configuration
    pub async fn remove_peer(&self, id: &str) -> ControllerResult<()> {
        if !self.is_leader() {
            let request = RemovePeerRequest { id: id.to_string() };
            self.send_to_leader(encode_message(REMOVE_PEER_REQUEST, &request)?)
                .await?;
            return Ok(());
        }
        self.remove_peer_local(id).await
    }

    pub(super) async fn remove_peer_local(&self, id: &str) -> ControllerResult<()> {
        self.require_leader()?;

        let servers = ServersWithIndex::from_membership(&self.metrics().membership_config);
        let server = servers
            .get(id)
            .ok_or_else(|| Error::Api(ApiError::not_found("member", id)))?;

        info!("removing {} at {}", server.id, server.address);
        let ids = BTreeSet::from([server.id.clone()]);
        let change = if server.is_voter {
            ChangeMembers::RemoveVoters(ids)
        } else {
            ChangeMembers::RemoveNodes(ids)
        };
        self.bounded_change(
            format!("removing {}", server.id),
            self.inner.raft.change_membership(change, false),
        )
        .await
    }

    /// Hand leadership to `target`, or to the most up to date voter.
    ///
    /// Returns once another member leads.
    pub async fn transfer_leadership(&self, target: Option<&str>) -> ControllerResult<()> {
        if !self.is_leader() {
            let request = TransferLeadershipRequest {
                id: target.map(str::to_string),
            };
            self.send_to_leader(encode_message(TRANSFER_LEADERSHIP_REQUEST, &request)?)
                .await?;
            return Ok(());
        }
        self.transfer_leadership_local(target).await
    }

    pub(super) async fn transfer_leadership_local(
        &self,
        target: Option<&str>,
    ) -> ControllerResult<()> {
        self.require_leader()?;

        let metrics = self.metrics();
        let own_id = &self.inner.config.id;
        let voters: BTreeSet<String> = metrics.membership_config.membership().voter_ids().collect();

        let target = match target {
            Some(target) => {
                if target == own_id {
                    return Err(Error::Api(ApiError::invalid(
                        "cannot transfer leadership to the current leader",
                    )));
                }
                if !voters.contains(target) {
                    return Err(Error::Api(ApiError::not_found("voter", target)));
                }
                target.to_string()
            }
            None => {
                let matched = metrics.replication.clone().unwrap_or_default();
                voters
                    .iter()
                    .filter(|id| *id != own_id)
                    .max_by_key(|id| {
                        matched
                            .get(*id)
                            .and_then(|log_id| log_id.as_ref().map(|l| l.index))
                    })
                    .cloned()
                    .ok_or_else(|| {
                        Error::Api(ApiError::invalid("no other voter to transfer leadership to"))
                    })?
            }
        };

        info!("transferring leadership to {}", target);
        self.inner
            .raft
            .trigger()
            .transfer_leader(target.clone())
            .await
            .map_err(|e| Error::Raft(e.to_string()))?;

        let timeout = self.inner.config.forward_timeout;
        let wait = async {
            while self.leader().as_deref() == Some(own_id.as_str()) {
                tokio::time::sleep(TRANSFER_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::timeout(format!("transferring leadership to {target}"), timeout))
    }

    /// Wait for a configuration change, at most `forward_timeout`
    async fn bounded_change<T, F>(&self, operation: String, change: F) -> ControllerResult<()>
    where
        F: Future<Output = Result<T, ClientWriteFailure>>,
    {
        let timeout = self.inner.config.forward_timeout;
        tokio::time::timeout(timeout, change)
            .await
            .map_err(|_| Error::timeout(operation, timeout))?
            .map_err(write_error)?;
        Ok(())
    }

    fn require_leader(&self) -> ControllerResult<()> {
        if self.is_leader() {
            return Ok(());
        }
        Err(Error::NotLeader {
            leader: self.leader(),
        })
    }
}

fn validate_peer(request: &AddPeerRequest) -> ControllerResult<()> {
    if request.id.is_empty() {
        return Err(Error::Validation(ApiError::field("id", "", "must not be empty")));
    }
    if request.address.is_empty() {
        return Err(Error::Validation(ApiError::field(
            "address",
            "",
            "must not be empty",
        )));
    }
    Ok(())
}
