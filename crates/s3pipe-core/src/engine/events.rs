//! Event publishing for running transfers

use s3pipe_types::{ObjectRef, TransferEvent, TransferState, TransferUpdate};
use tokio::sync::broadcast;

/// Cloneable handle used by coordinators and workers to publish events
///
/// Every event leaves tagged with the transfer id and object, since the
/// channel is shared by all transfers of an engine.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<TransferUpdate>,
    transfer: u64,
    object: ObjectRef,
}

impl EventSink {
    pub fn new(tx: broadcast::Sender<TransferUpdate>, transfer: u64, object: ObjectRef) -> Self {
        Self {
            tx,
            transfer,
            object,
        }
    }

    /// Publish an event; having no subscriber is fine
    pub fn emit(&self, event: TransferEvent) {
        let _ = self.tx.send(TransferUpdate {
            transfer: self.transfer,
            object: self.object.clone(),
            event,
        });
    }

    pub fn state(&self, state: TransferState, error: Option<String>) {
        self.emit(TransferEvent::StateChanged { state, error });
    }
}
