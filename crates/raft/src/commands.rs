//! Commands the controller itself replicates

use fabric_command::{
    ApiError, CodecResult, Command, CommandType, MutationContext, TypedCommand, cbor_body,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::ClusterId;

/// Assign the id of the logical cluster.
///
/// Only the first applied instance takes effect, so members that raced to
/// bootstrap still agree on a single id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitClusterIdCommand {
    /// The proposed id
    pub cluster_id: String,
}

impl InitClusterIdCommand {
    /// Propose `cluster_id`
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
        }
    }
}

impl Command for InitClusterIdCommand {
    fn command_type(&self) -> CommandType {
        Self::TYPE
    }

    fn encode_body(&self) -> CodecResult<Vec<u8>> {
        cbor_body(self)
    }

    fn validate(&self) -> Result<(), ApiError> {
        if self.cluster_id.trim().is_empty() {
            return Err(ApiError::field("clusterId", "", "must not be empty"));
        }
        Ok(())
    }

    fn apply(&self, ctx: &mut MutationContext<'_, '_>) -> Result<(), ApiError> {
        if let Some(existing) = ctx.tx().get_meta::<ClusterId>()? {
            info!(
                "ignoring cluster id {}, already initialized to {}",
                self.cluster_id, existing
            );
            return Ok(());
        }

        ctx.tx().put_meta::<ClusterId>(&self.cluster_id)?;
        Ok(())
    }
}

impl TypedCommand for InitClusterIdCommand {
    const TYPE: CommandType = 0x0000_0001;
}
