//! State writer
//!
//! Serializes record store writes on a dedicated task so that storage
//! latency and outages never reach the registry. Each write is retried with
//! backoff; when the retries run out the pool keeps running in memory and
//! logs that it is in degraded mode. The queue is bounded: while it is full
//! new writes are dropped and counted, and the shutdown flush waits for room.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::models::{EndpointId, EndpointState};
use crate::store::{RecordStore, RetryPolicy};

/// One pending write
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    SaveState {
        id: EndpointId,
        state: EndpointState,
        score: f64,
    },
    Removed {
        id: EndpointId,
    },
}

impl StoreCommand {
    fn endpoint_id(&self) -> &EndpointId {
        match self {
            StoreCommand::SaveState { id, .. } | StoreCommand::Removed { id } => id,
        }
    }
}

/// Producer side of the bounded write queue
#[derive(Clone)]
pub struct StateWriter {
    tx: mpsc::Sender<StoreCommand>,
    dropped: Arc<AtomicU64>,
}

impl StateWriter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StoreCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn save_state(&self, id: EndpointId, state: EndpointState, score: f64) {
        self.send(StoreCommand::SaveState { id, state, score });
    }

    pub fn removed(&self, id: EndpointId) {
        self.send(StoreCommand::Removed { id });
    }

    /// Queue a state write, waiting for room instead of dropping it
    pub async fn save_state_waiting(&self, id: EndpointId, state: EndpointState, score: f64) {
        if let Err(e) = self.tx.send(StoreCommand::SaveState { id, state, score }).await {
            debug!(endpoint_id = %e.0.endpoint_id(), "State writer stopped, dropping write");
        }
    }

    /// Writes discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, command: StoreCommand) {
        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    endpoint_id = %command.endpoint_id(),
                    dropped_total = total,
                    "State write queue full, dropping write"
                );
            }
            Err(mpsc::error::TrySendError::Closed(command)) => {
                debug!(
                    endpoint_id = %command.endpoint_id(),
                    "State writer stopped, dropping write"
                );
            }
        }
    }
}

/// Consumer side: applies writes to the record store
pub struct StateWriterService {
    rx: mpsc::Receiver<StoreCommand>,
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
    degraded: AtomicBool,
}

impl StateWriterService {
    pub fn new(
        rx: mpsc::Receiver<StoreCommand>,
        store: Arc<dyn RecordStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            rx,
            store,
            retry,
            degraded: AtomicBool::new(false),
        }
    }

    /// Run until shutdown, then apply every write already queued
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting state writer");

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.apply(command).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.rx.close();
        let mut flushed = 0usize;
        while let Ok(command) = self.rx.try_recv() {
            self.apply(command).await;
            flushed += 1;
        }

        info!(flushed, "State writer shutting down");
    }

    async fn apply(&self, command: StoreCommand) {
        let result = self.execute(&command).await;

        match result {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("Record store reachable again, leaving degraded mode");
                }
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "Record store unavailable, continuing in degraded mode");
                }
                warn!(
                    endpoint_id = %command.endpoint_id(),
                    error = %e,
                    "Dropping record store write after retries"
                );
            }
        }
    }

    async fn execute(&self, command: &StoreCommand) -> Result<()> {
        match command {
            StoreCommand::SaveState { id, state, score } => {
                self.retry
                    .run("save_endpoint_state", move || {
                        self.store.save_endpoint_state(id, *state, *score)
                    })
                    .await
            }
            StoreCommand::Removed { id } => {
                self.retry
                    .run("record_endpoint_removed", move || self.store.record_endpoint_removed(id))
                    .await
            }
        }
    }
}
