//! Registration hand-off between the gateway and the scheduler.
//!
//! The gateway answers the worker right away and queues a
//! [`RegistrationEvent`]; the pump forwards it to the scheduler, then sends
//! the freshly known node its metric configuration.

use crate::communicator::NodeCommunicator;
use crate::identity::NodeIdentityCache;
use crate::models::RegisterRequest;
use crate::scheduler::SchedulerCallbacks;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const REGISTRATION_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct RegistrationEvent {
    /// Node name from the URL path.
    pub node: String,
    pub request: RegisterRequest,
}

pub fn channel() -> (mpsc::Sender<RegistrationEvent>, mpsc::Receiver<RegistrationEvent>) {
    mpsc::channel(REGISTRATION_QUEUE)
}

pub struct RegistrationPump {
    scheduler: Arc<dyn SchedulerCallbacks>,
    identity: Arc<NodeIdentityCache>,
    communicator: Arc<NodeCommunicator>,
}

impl RegistrationPump {
    pub fn new(
        scheduler: Arc<dyn SchedulerCallbacks>,
        identity: Arc<NodeIdentityCache>,
        communicator: Arc<NodeCommunicator>,
    ) -> Self {
        Self { scheduler, identity, communicator }
    }

    pub async fn handle(&self, event: RegistrationEvent) {
        let node = event.node;
        if let Err(e) = self.scheduler.node_registered(event.request).await {
            warn!(%node, error = %e, "scheduler rejected registration");
            return;
        }
        match self.identity.resolve(&node).await {
            Some(id) => {
                if let Err(e) = self.communicator.set_metric_guid(&node, id) {
                    warn!(%node, error = %e, "cannot push metric configuration");
                }
            }
            None => info!(%node, "registered node not yet known to the scheduler directory"),
        }
    }

    pub async fn run(self, mut events: mpsc::Receiver<RegistrationEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
        debug!("registration pump stopped");
    }
}
