//! Transfer engine - entry point for running transfers
//!
//! Validates the configuration, opens the local side, and hands off to the
//! upload or download task. Progress is published on a broadcast channel
//! shared by every transfer; each update names its transfer id and object.

use crate::engine::download::DownloadTask;
use crate::engine::events::EventSink;
use crate::engine::upload::UploadTask;
use crate::error::TransferError;
use crate::store::ObjectStore;
use s3pipe_types::{Direction, ObjectRef, TransferConfig, TransferReport, TransferUpdate};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Local end of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalTarget {
    /// Read from or write to a file
    Path(PathBuf),
    /// Standard input for uploads, standard output for downloads
    Stdio,
}

/// A complete transfer request
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub config: TransferConfig,
    pub local: LocalTarget,
}

/// Runs transfers against one object store
pub struct TransferEngine {
    store: Arc<dyn ObjectStore>,
    event_tx: broadcast::Sender<TransferUpdate>,
    next_transfer: AtomicU64,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            store,
            event_tx,
            next_transfer: AtomicU64::new(1),
        }
    }

    /// Subscribe to updates of every transfer started afterwards
    pub fn subscribe(&self) -> broadcast::Receiver<TransferUpdate> {
        self.event_tx.subscribe()
    }

    /// A sink for a new transfer, tagged with a fresh id
    fn events(&self, object: &ObjectRef) -> EventSink {
        let transfer = self.next_transfer.fetch_add(1, Ordering::Relaxed);
        debug!("Transfer {} is {}", transfer, object);
        EventSink::new(self.event_tx.clone(), transfer, object.clone())
    }

    /// Run a request, opening the local file or standard stream it names
    pub async fn run(&self, request: TransferRequest) -> Result<TransferReport, TransferError> {
        validate(&request.config)?;

        match (request.config.direction, request.local) {
            (Direction::Upload, LocalTarget::Path(path)) => {
                info!("Uploading {}", path.display());
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(TransferError::SourceRead)?;
                self.upload(request.config, file).await
            }
            (Direction::Upload, LocalTarget::Stdio) => {
                info!("Uploading from standard input");
                self.upload(request.config, tokio::io::stdin()).await
            }
            (Direction::Download, LocalTarget::Path(path)) => {
                info!("Downloading to {}", path.display());
                let file = tokio::fs::File::create(&path)
                    .await
                    .map_err(TransferError::OutputWrite)?;
                self.download(request.config, file).await
            }
            (Direction::Download, LocalTarget::Stdio) => {
                info!("Downloading to standard output");
                self.download(request.config, tokio::io::stdout()).await
            }
        }
    }

    /// Upload everything `source` yields
    pub async fn upload<R: AsyncRead + Unpin>(
        &self,
        config: TransferConfig,
        source: R,
    ) -> Result<TransferReport, TransferError> {
        validate(&config)?;
        if config.direction != Direction::Upload {
            return Err(TransferError::InvalidConfig(
                "upload requested with a download configuration".to_string(),
            ));
        }
        let events = self.events(&config.object);
        UploadTask::new(self.store.clone(), config, events)
            .run(source)
            .await
    }

    /// Download the configured object into `output`
    pub async fn download<W: AsyncWrite + Unpin>(
        &self,
        config: TransferConfig,
        output: W,
    ) -> Result<TransferReport, TransferError> {
        validate(&config)?;
        if config.direction != Direction::Download {
            return Err(TransferError::InvalidConfig(
                "download requested with an upload configuration".to_string(),
            ));
        }
        let events = self.events(&config.object);
        DownloadTask::new(self.store.clone(), config, events)
            .run(output)
            .await
    }
}

fn validate(config: &TransferConfig) -> Result<(), TransferError> {
    if config.concurrency == 0 {
        return Err(TransferError::InvalidConfig(
            "concurrency must be at least 1".to_string(),
        ));
    }
    if config.object.bucket.is_empty() {
        return Err(TransferError::InvalidConfig("bucket must not be empty".to_string()));
    }
    if config.object.key.is_empty() {
        return Err(TransferError::InvalidConfig("key must not be empty".to_string()));
    }
    if config.direction == Direction::Download && !config.headers.is_empty() {
        return Err(TransferError::InvalidConfig(
            "headers only apply to uploads".to_string(),
        ));
    }
    if config.part_size.max_parts == 0 {
        return Err(TransferError::InvalidConfig(
            "max parts must be at least 1".to_string(),
        ));
    }
    Ok(())
}
