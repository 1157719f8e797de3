//! The observer: polls the observable's root and keeps a local mirror of its
//! Merkle DAG.
//!
//! The poll loop never blocks on a sync: tasks run on the runtime, so a root
//! change observed mid-sync cancels the in-flight task and supersedes it with
//! one for the newer revision.

pub mod client;
mod task;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

pub use self::client::{Client, ClientError};
pub use self::task::{SyncError, TaskStatus, MAX_IN_FLIGHT_REQUESTS};
use self::task::SyncTask;
use crate::merkle::{MerkleDag, MerkleId, Payload};
use crate::protocol::RootResponse;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The observer's installed state: the last fully synced Merkle DAG.
#[derive(Debug, Clone, Default)]
pub struct ObserverState {
    inner: Arc<RwLock<Option<Arc<MerkleDag>>>>,
}

impl ObserverState {
    pub fn current(&self) -> Option<Arc<MerkleDag>> {
        self.inner.read().clone()
    }

    pub fn root_merkle_id(&self) -> Option<MerkleId> {
        self.current().map(|dag| dag.root_merkle_id.clone())
    }

    pub(crate) fn payload(&self, payload_id: &str) -> Option<Payload> {
        self.current()?.payload_map.get(payload_id).cloned()
    }

    pub(crate) fn install(&self, dag: Arc<MerkleDag>) {
        *self.inner.write() = Some(dag);
    }
}

pub struct Observer {
    client: Client,
    state: ObserverState,
    done_tx: broadcast::Sender<Arc<MerkleDag>>,
    poll_interval: Duration,
    current: Option<RunningTask>,
}

struct RunningTask {
    task: SyncTask,
    root_merkle_id: MerkleId,
    version: i64,
}

impl Observer {
    pub fn new(endpoint: Url) -> Result<Self, ClientError> {
        let (done_tx, _) = broadcast::channel(16);
        Ok(Observer {
            client: Client::new(endpoint)?,
            state: ObserverState::default(),
            done_tx,
            poll_interval: POLL_INTERVAL,
            current: None,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> ObserverState {
        self.state.clone()
    }

    /// Every completed sync is broadcast after its DAG is installed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<MerkleDag>> {
        self.done_tx.subscribe()
    }

    /// Poll until `cancel` fires. An in-flight sync is aborted on shutdown.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        if let Some(running) = &self.current {
            running.task.abort();
        }
    }

    async fn tick(&mut self) {
        let root = match self.client.root().await {
            Ok(root) => root,
            Err(err) => {
                warn!("root poll failed: {err}");
                return;
            }
        };

        if self.state.root_merkle_id().as_deref() == Some(root.id.as_str()) {
            trace!(root = %root.id, "root unchanged");
            return;
        }

        match &self.current {
            // A live task either keeps going (same root, or a newer version
            // than advertised) or is superseded.
            Some(running) if running.task.status() == TaskStatus::InProgress => {
                if running.root_merkle_id != root.id && running.version <= root.version {
                    info!(
                        old = %running.root_merkle_id,
                        new = %root.id,
                        "root changed, restarting sync"
                    );
                    running.task.abort();
                    self.start(root);
                } else {
                    debug!(root = %running.root_merkle_id, "sync in progress");
                }
            }
            // No task, or the previous one finished (done, failed or
            // aborted): start fresh. Failures retry here on every tick.
            _ => {
                info!(root = %root.id, version = root.version, "starting sync");
                self.start(root);
            }
        }
    }

    fn start(&mut self, root: RootResponse) {
        let task = SyncTask::new(
            self.client.clone(),
            self.state.clone(),
            self.done_tx.clone(),
            root.id.clone(),
            root.version,
        );
        tokio::spawn(task.clone().run());
        self.current = Some(RunningTask {
            task,
            root_merkle_id: root.id,
            version: root.version,
        });
    }
}
