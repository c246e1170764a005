//! # Stream Writer Module
//!
//! One background task per open stream. Writes for a stream are queued on
//! an unbounded channel and executed one at a time, so flush N is durable
//! before flush N+1 starts and on-disk order matches emission order.
//!
//! ## Architecture
//! ```text
//! CircularTimeframe ──► StreamSink ──┐
//!                                    ├─► WriteCommand queue ──► writer_loop ──► StorageService
//! RecordingSession ──► StreamWriter ─┘                              │
//!                                                                   └─► ack (oneshot) per write
//! ```
//!
//! The writer task owns the `StorageHandle`; nothing else can write to or
//! close the file while it runs.

use crate::error::StorageError;
use crate::record::encode_samples;
use crate::sample::Sample;
use crate::storage::{StorageHandle, StorageService};
use crate::timeframe::{FlushSink, PendingWrite, WriteAck};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Command sent from the session to a writer task
#[derive(Debug)]
enum WriteCommand {
    /// Append bytes to the stream and report the outcome
    Append { bytes: Vec<u8>, ack: WriteAck },
    /// Close the handle and stop the task
    Close {
        ack: oneshot::Sender<Result<(), StorageError>>,
    },
}

/// Handle to a running writer task for one stream
pub struct StreamWriter {
    path: PathBuf,
    command_tx: mpsc::UnboundedSender<WriteCommand>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl StreamWriter {
    /// Open a fresh stream at `path` and start its writer task.
    ///
    /// Any existing file at `path` is deleted first. `header` is written
    /// before the task starts, so it always precedes every queued write.
    pub async fn open(
        storage: Arc<dyn StorageService>,
        path: PathBuf,
        header: &[u8],
    ) -> Result<Self, StorageError> {
        if storage.exists(&path).await? {
            log::debug!("Replacing existing stream {}", path.display());
            storage.delete(&path, false).await?;
        }

        let handle = storage.open(&path).await?;
        if !header.is_empty() {
            if let Err(e) = storage.write(&handle, header).await {
                if let Err(close_err) = storage.close(&handle).await {
                    log::warn!("Failed to close {} after header error: {}", handle, close_err);
                }
                return Err(e);
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(writer_loop(storage, handle, command_rx));

        Ok(Self {
            path,
            command_tx,
            task: Some(task),
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queue raw bytes for appending
    pub fn append_bytes(&self, bytes: Vec<u8>) -> PendingWrite {
        send_append(&self.command_tx, bytes)
    }

    /// A `FlushSink` that encodes sample batches into this stream
    pub fn sink(&self) -> StreamSink {
        StreamSink {
            command_tx: self.command_tx.clone(),
        }
    }

    /// Close the stream after every queued write has run.
    ///
    /// Calling this again is a no-op.
    pub async fn close(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let (ack, rx) = oneshot::channel();
        let result = if self.command_tx.send(WriteCommand::Close { ack }).is_ok() {
            rx.await.unwrap_or(Err(StorageError::WriterGone))
        } else {
            Err(StorageError::WriterGone)
        };

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Writer task for {} panicked: {}", self.path.display(), e);
            }
        }
        result
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.closed {
            // Let the task close the handle on its own
            let (ack, _) = oneshot::channel();
            let _ = self.command_tx.send(WriteCommand::Close { ack });
        }
    }
}

/// Sample sink feeding a `StreamWriter`
pub struct StreamSink {
    command_tx: mpsc::UnboundedSender<WriteCommand>,
}

impl FlushSink for StreamSink {
    fn submit(&mut self, batch: Vec<Sample>) -> PendingWrite {
        send_append(&self.command_tx, encode_samples(&batch))
    }
}

fn send_append(command_tx: &mpsc::UnboundedSender<WriteCommand>, bytes: Vec<u8>) -> PendingWrite {
    let (ack, pending) = PendingWrite::channel();
    match command_tx.send(WriteCommand::Append { bytes, ack }) {
        Ok(()) => pending,
        Err(_) => PendingWrite::ready(Err(StorageError::WriterGone)),
    }
}

/// Execute commands for one stream until it is closed
async fn writer_loop(
    storage: Arc<dyn StorageService>,
    handle: StorageHandle,
    mut command_rx: mpsc::UnboundedReceiver<WriteCommand>,
) {
    loop {
        match command_rx.recv().await {
            Some(WriteCommand::Append { bytes, ack }) => {
                let result = storage.write(&handle, &bytes).await;
                if let Err(e) = &result {
                    log::warn!("Write of {} bytes to {} failed: {}", bytes.len(), handle, e);
                }
                // The timeframe may already be gone; the data is its concern
                let _ = ack.send(result);
            }
            Some(WriteCommand::Close { ack }) => {
                let result = storage.close(&handle).await;
                if let Err(e) = &result {
                    log::error!("Failed to close {}: {}", handle, e);
                }
                let _ = ack.send(result);
                log::debug!("Writer for {} stopped", handle);
                break;
            }
            None => {
                if let Err(e) = storage.close(&handle).await {
                    log::error!("Failed to close {}: {}", handle, e);
                }
                log::debug!("Writer for {}: command channel closed", handle);
                break;
            }
        }
    }
}
