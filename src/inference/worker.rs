//! Engine worker thread
//!
//! Engine resources hold raw pointers and are not `Send`, so a host that
//! wants to drive a session from async code runs it on a dedicated worker
//! thread. The host talks to the worker through a command channel and reads
//! generated text from a per-request stream.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::inference::backend::Backend;
use crate::inference::generation::{CancelHandle, GenerationRequest};
use crate::inference::session::{LoadError, Session};
use crate::inference::streaming::{ChannelSink, StreamToken};
use crate::types::{ConfigError, EngineConfig, StatusCode};

/// Errors returned by worker operations
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Worker thread error: {0}")]
    Disconnected(String),
}

impl StatusCode for WorkerError {
    fn status_code(&self) -> i32 {
        match self {
            WorkerError::Config(e) => e.status_code(),
            WorkerError::Load(e) => e.status_code(),
            WorkerError::Disconnected(_) => -3,
        }
    }
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Configure {
        json: String,
        response_tx: Sender<Result<(), ConfigError>>,
    },
    Config {
        response_tx: Sender<EngineConfig>,
    },
    LoadModel {
        path: PathBuf,
        response_tx: Sender<Result<(), LoadError>>,
    },
    LoadProjector {
        path: PathBuf,
        response_tx: Sender<Result<(), LoadError>>,
    },
    Infer {
        request: GenerationRequest,
        token_tx: UnboundedSender<StreamToken>,
    },
    Free {
        response_tx: Sender<()>,
    },
    Shutdown,
}

/// Handle to a session running on its own thread
pub struct EngineWorker {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// The session's cancel flag, written directly
    cancel: CancelHandle,
}

impl EngineWorker {
    /// Starts the worker thread. `factory` runs on that thread, so the
    /// backend itself does not need to be `Send`.
    pub fn spawn<B, F>(factory: F) -> Result<Self, WorkerError>
    where
        B: Backend + 'static,
        F: FnOnce() -> B + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<CancelHandle>();

        let handle = thread::Builder::new()
            .name("mandre-engine".to_string())
            .spawn(move || {
                let session = Session::new(factory());
                if ready_tx.send(session.cancel_handle()).is_err() {
                    return;
                }
                worker_thread_main(session, command_rx);
            })
            .map_err(|e| WorkerError::Disconnected(e.to_string()))?;

        let cancel = ready_rx
            .recv()
            .map_err(|e| WorkerError::Disconnected(e.to_string()))?;

        tracing::info!("Engine worker thread started");
        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            cancel,
        })
    }

    fn send(&self, command: WorkerCommand) -> Result<(), WorkerError> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| WorkerError::Disconnected("worker shut down".to_string()))?
            .send(command)
            .map_err(|e| WorkerError::Disconnected(e.to_string()))
    }

    fn wait<T>(response_rx: Receiver<T>) -> Result<T, WorkerError> {
        response_rx
            .recv()
            .map_err(|e| WorkerError::Disconnected(e.to_string()))
    }

    pub fn configure(&self, json: &str) -> Result<(), WorkerError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::Configure {
            json: json.to_string(),
            response_tx,
        })?;
        Ok(Self::wait(response_rx)??)
    }

    /// Snapshot of the session's current configuration
    pub fn config(&self) -> Result<EngineConfig, WorkerError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::Config { response_tx })?;
        Self::wait(response_rx)
    }

    pub fn load_model<P: AsRef<Path>>(&self, path: P) -> Result<(), WorkerError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::LoadModel {
            path: path.as_ref().to_path_buf(),
            response_tx,
        })?;
        Ok(Self::wait(response_rx)??)
    }

    pub fn load_projector<P: AsRef<Path>>(&self, path: P) -> Result<(), WorkerError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::LoadProjector {
            path: path.as_ref().to_path_buf(),
            response_tx,
        })?;
        Ok(Self::wait(response_rx)??)
    }

    /// Queues a generation and returns its stream.
    ///
    /// The stream yields `Token` items followed by exactly one `Done` or
    /// `Error`. Dropping the receiver stops the generation.
    pub fn infer_stream(&self, request: GenerationRequest) -> Result<UnboundedReceiver<StreamToken>, WorkerError> {
        let (token_tx, token_rx) = unbounded_channel();
        self.send(WorkerCommand::Infer { request, token_tx })?;
        Ok(token_rx)
    }

    /// Cancels the running generation. Does not wait for the queue.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Releases the session's engine resources; the worker keeps running.
    pub fn free_engine(&self) -> Result<(), WorkerError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::Free { response_tx })?;
        Self::wait(response_rx)
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        // Stop any generation in flight so the join below does not wait on it
        self.cancel.cancel();
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
fn worker_thread_main<B: Backend>(mut session: Session<B>, command_rx: Receiver<WorkerCommand>) {
    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Configure { json, response_tx }) => {
                let _ = response_tx.send(session.configure(&json));
            }
            Ok(WorkerCommand::Config { response_tx }) => {
                let _ = response_tx.send(session.config().clone());
            }
            Ok(WorkerCommand::LoadModel { path, response_tx }) => {
                let _ = response_tx.send(session.load_model(&path));
            }
            Ok(WorkerCommand::LoadProjector { path, response_tx }) => {
                let _ = response_tx.send(session.load_projector(&path));
            }
            Ok(WorkerCommand::Infer { request, token_tx }) => {
                let mut sink = ChannelSink(token_tx);
                let last = match session.infer(&request, &mut sink) {
                    Ok(report) => StreamToken::Done(report),
                    Err(e) => StreamToken::Error(e.to_string()),
                };
                if !sink.finish(last) {
                    tracing::debug!("Stream receiver dropped before completion");
                }
            }
            Ok(WorkerCommand::Free { response_tx }) => {
                session.free_engine();
                let _ = response_tx.send(());
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
    session.free_engine();
}
