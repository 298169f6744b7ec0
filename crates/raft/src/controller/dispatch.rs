//! Command dispatch: apply on the leader, forward from followers

use fabric_command::Command;
use fabric_mesh::Message;
use openraft::error::{ClientWriteError, RaftError};
use tracing::debug;

use super::Controller;
use crate::messages::{NEW_LOG_ENTRY, decode_reply};
use crate::{CommandPayload, ControllerResult, Error, TypeConfig};

impl Controller {
    /// Replicate `command` and return the index it was applied at.
    ///
    /// On the leader the command is applied directly. A follower forwards it
    /// and only returns once its own state machine has caught up to the
    /// returned index, so the caller can read its own write locally.
    pub async fn dispatch(&self, command: &dyn Command) -> ControllerResult<u64> {
        command.validate().map_err(Error::Validation)?;
        if self.inner.mesh.is_read_only() {
            return Err(Error::ReadOnly);
        }

        let data = command.encode()?;
        self.dispatch_encoded(data).await
    }

    async fn dispatch_encoded(&self, data: Vec<u8>) -> ControllerResult<u64> {
        if self.is_leader() {
            return self.apply_local(data).await;
        }

        let (leader, _) = self.leader_address().ok_or(Error::NoLeader)?;
        if leader == self.inner.config.id {
            // metrics lag behind a leadership change
            return self.apply_local(data).await;
        }

        debug!("forwarding command to leader {}", leader);
        let index = self
            .send_to_leader(Message::new(NEW_LOG_ENTRY, data))
            .await?
            .ok_or_else(|| Error::Protocol("leader acknowledged a command without an index".to_string()))?;

        self.inner
            .fsm
            .tracker()
            .wait_for(index, self.inner.config.index_wait_timeout)
            .await?;
        Ok(index)
    }

    /// Apply an encoded command through the local raft instance, which must
    /// be the leader.
    pub(crate) async fn apply_local(&self, data: Vec<u8>) -> ControllerResult<u64> {
        let _permit = self.inner.rate_limiter.acquire().await?;

        let timeout = self.inner.config.raft.commit_timeout;
        let write = self.inner.raft.client_write(CommandPayload::new(data));
        let response = tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| Error::timeout("applying command", timeout))?
            .map_err(write_error)?;

        let result = response.data;
        match result.error {
            Some(payload) => Err(Error::Api(self.inner.causes.decode(payload))),
            None => Ok(result.index),
        }
    }

    /// Send `message` to the current leader and interpret its reply
    pub(crate) async fn send_to_leader(&self, message: Message) -> ControllerResult<Option<u64>> {
        let (leader, address) = self.leader_address().ok_or(Error::NoLeader)?;
        if leader == self.inner.config.id {
            return Err(Error::NotLeader {
                leader: Some(leader),
            });
        }

        let peer = self
            .inner
            .mesh
            .get_or_connect(&address, self.inner.config.connect_timeout)
            .await?;
        let reply = peer
            .request(message, self.inner.config.forward_timeout)
            .await?;

        decode_reply(&reply, &self.inner.causes)
    }
}

/// Map a failed raft write, keeping "not leader" distinguishable
pub(crate) fn write_error(e: RaftError<TypeConfig, ClientWriteError<TypeConfig>>) -> Error {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => Error::NotLeader {
            leader: forward.leader_id,
        },
        e => Error::Raft(e.to_string()),
    }
}
