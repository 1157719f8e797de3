//! The sync task: materialize one Merkle DAG revision, fetching only what the
//! previously installed state cannot provide.
//!
//! Every frontier of Merkle nodes is expanded concurrently: nodes already
//! visited are skipped, nodes whose Merkle id exists in the installed state
//! are migrated wholesale (the Merkle invariant guarantees the entire
//! reachable sub-DAG is identical), and only the remainder is queried over
//! the wire. A task owns a private buffer; the observer's state is swapped
//! only after the whole tree of expansions and payload fetches settles
//! cleanly. Failure or abort publishes nothing.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore, SemaphorePermit};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{Client, ClientError};
use super::ObserverState;
use crate::merkle::{MerkleDag, MerkleGraph, MerkleId, MerkleNode, Payload, PayloadId, PayloadMap};
use crate::protocol::QueryItem;

/// Admission bound on concurrent outbound requests. A tunable, not a
/// protocol constant.
pub const MAX_IN_FLIGHT_REQUESTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    InProgress,
    Done,
    Failed,
    Aborted,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync cancelled")]
    Cancelled,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("installed state is inconsistent: {0}")]
    Migration(String),
    #[error("observable returned an empty payload for {payload_id}")]
    EmptyPayload { payload_id: PayloadId },
    #[error("sync worker died: {0}")]
    Join(String),
}

/// Task-private buffer. One lock covers the DAG under construction and the
/// visited sets; migration acquires it after the installed-state snapshot,
/// never the other way around.
#[derive(Debug, Default)]
struct Buffer {
    dag: MerkleDag,
    visited_merkle_ids: HashSet<MerkleId>,
    visited_payload_ids: HashSet<PayloadId>,
    /// Payloads a fetch was already spawned for, so one payload is fetched
    /// at most once per task even when it shows up in concurrent frontiers.
    requested_payload_ids: HashSet<PayloadId>,
}

#[derive(Clone)]
pub(crate) struct SyncTask {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    client: Client,
    state: ObserverState,
    done_tx: broadcast::Sender<Arc<MerkleDag>>,
    root_merkle_id: MerkleId,
    version: i64,
    buffer: Mutex<Buffer>,
    status: Mutex<TaskStatus>,
    failure: Mutex<Option<String>>,
    cancel: CancellationToken,
    requests: Semaphore,
}

impl SyncTask {
    pub(crate) fn new(
        client: Client,
        state: ObserverState,
        done_tx: broadcast::Sender<Arc<MerkleDag>>,
        root_merkle_id: MerkleId,
        version: i64,
    ) -> Self {
        SyncTask {
            inner: Arc::new(TaskInner {
                client,
                state,
                done_tx,
                root_merkle_id,
                version,
                buffer: Mutex::new(Buffer::default()),
                status: Mutex::new(TaskStatus::InProgress),
                failure: Mutex::new(None),
                cancel: CancellationToken::new(),
                requests: Semaphore::new(MAX_IN_FLIGHT_REQUESTS),
            }),
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        *self.inner.status.lock()
    }

    /// Cancel the task. Pending requests, semaphore waits and expansions
    /// unblock with a cancellation error; nothing is installed.
    pub(crate) fn abort(&self) {
        self.inner.cancel.cancel();
    }

    pub(crate) async fn run(self) {
        let result = self.inner.clone().sync().await;

        let failure = self.inner.failure.lock().take();
        let status = if let Some(message) = failure {
            warn!(root = %self.inner.root_merkle_id, "sync failed: {message}");
            TaskStatus::Failed
        } else if self.inner.cancel.is_cancelled() {
            debug!(root = %self.inner.root_merkle_id, "sync aborted");
            TaskStatus::Aborted
        } else if let Err(err) = result {
            warn!(root = %self.inner.root_merkle_id, "sync failed: {err}");
            TaskStatus::Failed
        } else {
            let dag = {
                let mut buffer = self.inner.buffer.lock();
                Arc::new(std::mem::take(&mut buffer.dag))
            };
            info!(
                root = %dag.root_merkle_id,
                version = dag.version,
                nodes = dag.merkle_graph.len(),
                "sync done"
            );
            self.inner.state.install(dag.clone());
            // Listeners run strictly after the install.
            let _ = self.inner.done_tx.send(dag);
            TaskStatus::Done
        };
        *self.inner.status.lock() = status;
    }
}

impl TaskInner {
    async fn sync(self: Arc<Self>) -> Result<(), SyncError> {
        let response = self
            .request(self.client.sources(&self.root_merkle_id))
            .await?;

        {
            let mut buffer = self.buffer.lock();
            buffer.dag = MerkleDag {
                version: self.version,
                root_merkle_id: self.root_merkle_id.clone(),
                merkle_graph: MerkleGraph::with_capacity(response.size),
                payload_map: PayloadMap::with_capacity(response.size),
                sources: response.sources.iter().cloned().map(Into::into).collect(),
            };
        }

        let frontier = response
            .sources
            .into_iter()
            .map(|source| QueryItem {
                merkle_id: source.id,
                payload_id: source.payload_id,
            })
            .collect();
        // The sources have no parent; their own graph entries are written
        // when their query responses come back.
        self.expand(None, frontier).await
    }

    /// Expand one frontier: migrate or fetch every node in `items`, record
    /// the frontier under `parent`, then recurse into the fetched children.
    fn expand(
        self: Arc<Self>,
        parent: Option<MerkleId>,
        items: Vec<QueryItem>,
    ) -> BoxFuture<'static, Result<(), SyncError>> {
        async move {
            let mut fetch_list = Vec::new();
            for item in &items {
                if self.is_visited_merkle_id(&item.merkle_id) {
                    continue;
                }
                if self.migrate(&item.merkle_id, &item.payload_id)? {
                    continue;
                }
                fetch_list.push(item.clone());
            }

            let mut workers: JoinSet<Result<(), SyncError>> = JoinSet::new();
            for item in &fetch_list {
                if !self.mark_payload_requested(&item.payload_id) {
                    continue;
                }
                let task = self.clone();
                let payload_id = item.payload_id.clone();
                workers.spawn(async move { task.sync_payload(payload_id).await });
            }

            if let Some(parent) = parent {
                self.set_merkle_graph(parent, items.iter().map(MerkleNode::from).collect());
            }

            if !fetch_list.is_empty() {
                let merkle_ids: Vec<MerkleId> = fetch_list
                    .iter()
                    .map(|item| item.merkle_id.clone())
                    .collect();
                let response = {
                    let _permit = self.acquire().await?;
                    self.request(self.client.query(&merkle_ids)).await?
                };

                for (merkle_id, children) in response {
                    if children.is_empty() {
                        self.set_merkle_graph(merkle_id, Vec::new());
                        continue;
                    }
                    let task = self.clone();
                    workers.spawn(task.expand(Some(merkle_id), children));
                }
            }

            while let Some(joined) = workers.join_next().await {
                joined.map_err(|err| SyncError::Join(err.to_string()))??;
            }
            Ok(())
        }
        .boxed()
    }

    async fn sync_payload(self: Arc<Self>, payload_id: PayloadId) -> Result<(), SyncError> {
        let _permit = self.acquire().await?;

        // A concurrent expansion or migration may have installed it already.
        if self.is_visited_payload_id(&payload_id) {
            return Ok(());
        }
        if self.buffer.lock().dag.payload_map.contains_key(&payload_id) {
            return Ok(());
        }
        // Unchanged payloads come from the installed state without touching
        // the wire.
        if let Some(payload) = self.state.payload(&payload_id) {
            return self.set_payload(payload_id, payload);
        }

        let response = self.request(self.client.payload(&payload_id)).await?;
        self.set_payload(payload_id, response.payload)
    }

    /// Reuse the sub-DAG under `merkle_id` from the installed state, marking
    /// everything it reaches as visited. Returns false when the installed
    /// state does not contain the id.
    fn migrate(&self, merkle_id: &MerkleId, payload_id: &PayloadId) -> Result<bool, SyncError> {
        let Some(installed) = self.state.current() else {
            return Ok(false);
        };
        if !installed.merkle_graph.contains_key(merkle_id) {
            return Ok(false);
        }

        let mut buffer = self.buffer.lock();
        let mut stack = vec![(merkle_id.clone(), payload_id.clone())];
        while let Some((merkle_id, payload_id)) = stack.pop() {
            if buffer.visited_merkle_ids.contains(&merkle_id) {
                continue;
            }
            let Some(children) = installed.merkle_graph.get(&merkle_id) else {
                let err = SyncError::Migration(format!(
                    "merkle id {merkle_id} is referenced but missing from the installed graph"
                ));
                self.fail(&err);
                return Err(err);
            };
            let Some(payload) = installed.payload_map.get(&payload_id) else {
                let err = SyncError::Migration(format!(
                    "payload {payload_id} is referenced but missing from the installed state"
                ));
                self.fail(&err);
                return Err(err);
            };

            buffer.visited_merkle_ids.insert(merkle_id.clone());
            buffer.dag.merkle_graph.insert(merkle_id, children.clone());
            buffer.visited_payload_ids.insert(payload_id.clone());
            buffer.dag.payload_map.insert(payload_id, payload.clone());

            for child in children {
                stack.push((child.merkle_id.clone(), child.payload_id.clone()));
            }
        }
        Ok(true)
    }

    /// Run a client call, racing the cancellation token. Any error is
    /// recorded as the task failure and cancels the rest of the task.
    async fn request<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, ClientError>>,
    ) -> Result<T, SyncError> {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = call => result.map_err(SyncError::from),
        };
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>, SyncError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            permit = self.requests.acquire() => permit.map_err(|_| SyncError::Cancelled),
        }
    }

    /// Record the first failure and cancel everything still in flight.
    /// Cancellation itself is not a failure.
    fn fail(&self, err: &SyncError) {
        if matches!(err, SyncError::Cancelled) {
            return;
        }
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err.to_string());
            }
        }
        self.cancel.cancel();
    }

    fn is_visited_merkle_id(&self, merkle_id: &str) -> bool {
        self.buffer.lock().visited_merkle_ids.contains(merkle_id)
    }

    fn is_visited_payload_id(&self, payload_id: &str) -> bool {
        self.buffer.lock().visited_payload_ids.contains(payload_id)
    }

    fn mark_payload_requested(&self, payload_id: &PayloadId) -> bool {
        self.buffer
            .lock()
            .requested_payload_ids
            .insert(payload_id.clone())
    }

    fn set_merkle_graph(&self, merkle_id: MerkleId, nodes: Vec<MerkleNode>) {
        let mut buffer = self.buffer.lock();
        buffer.visited_merkle_ids.insert(merkle_id.clone());
        buffer.dag.merkle_graph.insert(merkle_id, nodes);
    }

    fn set_payload(&self, payload_id: PayloadId, payload: Payload) -> Result<(), SyncError> {
        if payload.is_empty() {
            let err = SyncError::EmptyPayload { payload_id };
            self.fail(&err);
            return Err(err);
        }
        let mut buffer = self.buffer.lock();
        buffer.visited_payload_ids.insert(payload_id.clone());
        buffer.dag.payload_map.insert(payload_id, payload);
        Ok(())
    }
}
