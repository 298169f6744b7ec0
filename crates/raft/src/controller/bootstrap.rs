//! Seeding a new cluster and joining configured members

use std::collections::BTreeMap;
use std::sync::Weak;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Controller, ControllerInner};
use crate::commands::InitClusterIdCommand;
use crate::messages::AddPeerRequest;
use crate::{ControllerResult, Error};

const LEADERSHIP_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl Controller {
    /// Seed the cluster if this member is brand new, then join the
    /// configured members in the background.
    pub(super) fn spawn_bootstrap(&self) {
        let weak = self.downgrade();
        let cancel = self.inner.cancel.clone();

        self.inner.tasks.spawn(async move {
            let Some(controller) = Controller::upgrade(&weak) else {
                return;
            };

            if !controller.is_initialized() && controller.inner.config.min_cluster_size <= 1 {
                let members = BTreeMap::from([(
                    controller.inner.config.id.clone(),
                    controller.inner.config.advertise_address.clone(),
                )]);
                if let Err(e) = controller.initialize_cluster(members).await {
                    warn!("failed to bootstrap cluster: {}", e);
                }
            }

            let own_address = controller.inner.config.advertise_address.clone();
            let targets: Vec<String> = controller
                .inner
                .config
                .initial_members
                .iter()
                .filter(|address| **address != own_address)
                .cloned()
                .collect();
            drop(controller);

            for address in targets {
                spawn_join(weak.clone(), cancel.clone(), address);
            }
        });
    }

    /// Wait for stable leadership, then assign the cluster id
    pub(super) fn spawn_finish_bootstrap(&self) {
        let weak = self.downgrade();
        let cancel = self.inner.cancel.clone();

        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = finish_bootstrap(weak) => {}
            }
        });
    }

    async fn wait_for_stable_leadership(&self) -> ControllerResult<()> {
        let timeout = self.inner.config.bootstrap_timeout;
        let deadline = Instant::now() + timeout;
        let mut seen = 0;

        while seen < 2 {
            if Instant::now() >= deadline {
                return Err(Error::timeout("waiting for bootstrap leadership", timeout));
            }
            tokio::time::sleep(LEADERSHIP_POLL_INTERVAL).await;
            seen = if self.is_leader() { seen + 1 } else { 0 };
        }
        Ok(())
    }

    async fn try_join_member(&self, address: &str) -> ControllerResult<()> {
        let peer = self
            .inner
            .mesh
            .get_or_connect(address, self.inner.config.connect_timeout)
            .await?;

        self.join(AddPeerRequest {
            id: peer.id().to_string(),
            address: peer.address().to_string(),
            is_voter: true,
        })
        .await
    }
}

async fn finish_bootstrap(weak: Weak<ControllerInner>) {
    let Some(controller) = Controller::upgrade(&weak) else {
        return;
    };

    if let Err(e) = controller.wait_for_stable_leadership().await {
        // another member may have won the election
        info!("not leading after bootstrap: {}", e);
        return;
    }

    if let Some(cluster_id) = controller.cluster_id() {
        debug!("cluster id already assigned: {}", cluster_id);
        return;
    }

    let command = InitClusterIdCommand::new(Uuid::new_v4().to_string());
    match controller.dispatch(&command).await {
        Ok(index) => info!(
            "proposed cluster id {} at index {}, assigned {:?}",
            command.cluster_id,
            index,
            controller.cluster_id()
        ),
        Err(e) => warn!("failed to assign cluster id: {}", e),
    }
}

/// Keep trying to join the member at `address` until it succeeds
fn spawn_join(weak: Weak<ControllerInner>, cancel: CancellationToken, address: String) {
    let Some(controller) = Controller::upgrade(&weak) else {
        return;
    };
    let interval = controller.inner.config.join_retry_interval;
    let tasks = controller.inner.tasks.clone();
    drop(controller);

    tasks.spawn(async move {
        loop {
            let Some(controller) = Controller::upgrade(&weak) else {
                return;
            };
            match controller.try_join_member(&address).await {
                Ok(()) => {
                    info!("joined member at {}", address);
                    return;
                }
                Err(e) => debug!("joining {} failed, retrying in {:?}: {}", address, interval, e),
            }
            drop(controller);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    });
}
