//! Mesh request handlers

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use fabric_mesh::ContentType;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::Controller;
use crate::messages::{
    ADD_PEER_REQUEST, AddPeerRequest, NEW_LOG_ENTRY, REMOVE_PEER_REQUEST, RemovePeerRequest,
    TRANSFER_LEADERSHIP_REQUEST, TransferLeadershipRequest, decode_body, error_response,
    success_response,
};
use crate::{ControllerResult, Error};

/// A forwarded command waiting for the worker
struct LogEntryJob {
    data: Bytes,
    reply: oneshot::Sender<fabric_mesh::Message>,
}

impl Controller {
    pub(super) fn register_handlers(&self) {
        let (tx, rx) = mpsc::channel(self.inner.config.command_handler.max_queue_size);
        self.spawn_command_worker(rx);

        // queueing happens before the returned future so forwarded commands
        // keep their arrival order
        self.inner.mesh.handle(NEW_LOG_ENTRY, move |peer, message| {
            let (reply, reply_rx) = oneshot::channel();
            let queued = tx.try_send(LogEntryJob {
                data: message.body,
                reply,
            });

            if let Err(TrySendError::Full(_)) = &queued {
                warn!(
                    "command queue full, rejecting command forwarded by {}",
                    peer.id()
                );
            }

            async move {
                match queued {
                    Ok(()) => reply_rx
                        .await
                        .unwrap_or_else(|_| error_response(&Error::Shutdown)),
                    Err(TrySendError::Full(_)) => error_response(&Error::TooManyUpdates),
                    Err(TrySendError::Closed(_)) => error_response(&Error::Shutdown),
                }
            }
            .boxed()
        });

        self.handle_request(ADD_PEER_REQUEST, |controller, request: AddPeerRequest| async move {
            controller.add_peer_local(request).await.map(|_| None)
        });
        self.handle_request(REMOVE_PEER_REQUEST, |controller, request: RemovePeerRequest| async move {
            controller.remove_peer_local(&request.id).await.map(|_| None)
        });
        self.handle_request(
            TRANSFER_LEADERSHIP_REQUEST,
            |controller, request: TransferLeadershipRequest| async move {
                controller
                    .transfer_leadership_local(request.id.as_deref())
                    .await
                    .map(|_| None)
            },
        );
    }

    /// Single worker applying forwarded commands in arrival order
    fn spawn_command_worker(&self, mut rx: mpsc::Receiver<LogEntryJob>) {
        let weak = self.downgrade();
        let cancel = self.inner.cancel.clone();

        self.inner.tasks.spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                let Some(controller) = Controller::upgrade(&weak) else {
                    break;
                };
                let reply = match controller.apply_forwarded(&job.data).await {
                    Ok(index) => success_response(Some(index)),
                    Err(e) => {
                        debug!("forwarded command failed: {}", e);
                        error_response(&e)
                    }
                };
                drop(controller);

                // the requester may have given up waiting
                let _ = job.reply.send(reply);
            }
        });
    }

    async fn apply_forwarded(&self, data: &[u8]) -> ControllerResult<u64> {
        if !self.is_leader() {
            return Err(Error::NotLeader {
                leader: self.leader(),
            });
        }
        if self.inner.mesh.is_read_only() {
            return Err(Error::ReadOnly);
        }

        {
            let command = self.inner.commands.decode(data)?;
            command.validate().map_err(Error::Validation)?;
        }

        self.apply_local(data.to_vec()).await
    }

    fn handle_request<Req, F, Fut>(&self, content_type: ContentType, op: F)
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Controller, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ControllerResult<Option<u64>>> + Send + 'static,
    {
        let weak = self.downgrade();
        let op = Arc::new(op);

        self.inner.mesh.handle(content_type, move |peer, message| {
            let weak = weak.clone();
            let op = op.clone();
            async move {
                let Some(controller) = Controller::upgrade(&weak) else {
                    return error_response(&Error::Shutdown);
                };

                let result = match decode_body::<Req>(&message) {
                    Ok(request) => op(controller, request).await,
                    Err(e) => Err(e),
                };

                match result {
                    Ok(index) => success_response(index),
                    Err(e) => {
                        debug!("request {} from {} failed: {}", content_type, peer.id(), e);
                        error_response(&e)
                    }
                }
            }
            .boxed()
        });
    }
}
