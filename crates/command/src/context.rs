//! Context handed to commands while they are applied

use fabric_db::Tx;
use serde::{Deserialize, Serialize};

/// Who caused a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Attribution {
    /// An authenticated identity (operator or API client)
    Identity {
        /// Identity id
        id: String,
        /// Identity name
        name: String,
    },
    /// A router acting on its own behalf
    Router {
        /// Router id
        id: String,
        /// Router name
        name: String,
    },
    /// The command carried no attribution
    Unattributed,
}

/// Metadata attached to every applied change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeContext {
    /// Log index of the entry carrying the change
    pub raft_index: u64,
    /// Originator of the change
    pub attribution: Attribution,
}

impl ChangeContext {
    /// Build a context, falling back to [`Attribution::Unattributed`]
    pub fn new(raft_index: u64, attribution: Option<Attribution>) -> Self {
        Self {
            raft_index,
            attribution: attribution.unwrap_or(Attribution::Unattributed),
        }
    }
}

/// Store transaction plus the change context of the entry being applied
pub struct MutationContext<'t, 'a> {
    tx: &'t mut Tx<'a>,
    change: ChangeContext,
}

impl<'t, 'a> MutationContext<'t, 'a> {
    /// Wrap a transaction
    pub fn new(tx: &'t mut Tx<'a>, change: ChangeContext) -> Self {
        Self { tx, change }
    }

    /// The transaction all side effects must go through
    pub fn tx(&self) -> &Tx<'a> {
        &*self.tx
    }

    /// Mutable access, needed to register pre-commit hooks
    pub fn tx_mut(&mut self) -> &mut Tx<'a> {
        &mut *self.tx
    }

    /// The change context
    pub fn change(&self) -> &ChangeContext {
        &self.change
    }
}
