//! The observable: holds the current Merkle DAG, rederives it when the
//! source-of-truth file changes, and serves the four read operations.
//!
//! Derivation runs on the blocking pool, outside any lock; publishing is a
//! pointer swap under the write lock, so read latency never depends on
//! derivation cost. Each file write preempts the in-flight derivation by
//! cancelling its token and starting over from a fresh snapshot. The loser
//! returns without publishing.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::Dag;
use crate::merkle::{self, GenerateError, MerkleDag, MerkleId, Payload};
use crate::protocol::{
    ErrorMessage, PayloadRequest, QueryItem, QueryRequest, QueryResponse, RootResponse,
    SourceEntry, SourcesRequest, SourcesResponse,
};

pub const DEFAULT_PORT: u16 = 3633;

/// A monotonically increasing request counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-route request counters, mostly interesting to tests asserting that an
/// unchanged republish causes no `/query` or `/payload` traffic.
#[derive(Debug, Default)]
pub struct Metrics {
    pub root: Counter,
    pub sources: Counter,
    pub query: Counter,
    pub payload: Counter,
}

/// Shared observable state: at most one published Merkle DAG.
#[derive(Debug, Clone, Default)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

#[derive(Debug, Default)]
struct ServiceInner {
    current: RwLock<Option<Arc<MerkleDag>>>,
    metrics: Metrics,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `dag` as the published value. Readers holding the previous
    /// value keep it until they drop their snapshot.
    pub fn publish(&self, dag: MerkleDag) {
        *self.inner.current.write() = Some(Arc::new(dag));
    }

    pub fn current(&self) -> Option<Arc<MerkleDag>> {
        self.inner.current.read().clone()
    }

    pub fn root(&self) -> Option<(MerkleId, i64)> {
        self.current()
            .map(|dag| (dag.root_merkle_id.clone(), dag.version))
    }

    pub fn sources(&self) -> Vec<merkle::Source> {
        self.current()
            .map(|dag| dag.sources.clone())
            .unwrap_or_default()
    }

    /// Expand a batch of Merkle ids. Known ids map to their (possibly empty)
    /// child lists, unknown ids to `[]`. Before the first publication the
    /// response is an empty map.
    pub fn query(&self, ids: &[MerkleId]) -> QueryResponse {
        let Some(dag) = self.current() else {
            return QueryResponse::new();
        };
        ids.iter()
            .map(|id| {
                let children = dag
                    .merkle_graph
                    .get(id)
                    .map(|nodes| nodes.iter().map(QueryItem::from).collect())
                    .unwrap_or_default();
                (id.clone(), children)
            })
            .collect()
    }

    pub fn payload(&self, id: &str) -> Option<Payload> {
        self.current()?.payload_map.get(id).cloned()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }
}

/// Owns the cancellation token of the in-flight derivation.
struct Reloader {
    service: Service,
    path: PathBuf,
    active: CancellationToken,
}

impl Reloader {
    fn new(service: Service, path: PathBuf) -> Self {
        Reloader {
            service,
            path,
            active: CancellationToken::new(),
        }
    }

    /// Preempt the in-flight derivation and start a fresh one from the
    /// current file snapshot.
    fn trigger(&mut self) {
        self.active.cancel();
        self.active = CancellationToken::new();
        let token = self.active.clone();
        let service = self.service.clone();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || reload(service, &path, token));
    }
}

fn reload(service: Service, path: &Path, cancel: CancellationToken) {
    let dag = match Dag::read_from(path) {
        Ok(dag) => dag,
        Err(err) => {
            warn!("failed to load DAG: {err:#}");
            return;
        }
    };

    let merkle = match merkle::generate(&dag, &cancel) {
        Ok(merkle) => merkle,
        Err(GenerateError::Cancelled) => {
            debug!("derivation preempted");
            return;
        }
        Err(err) => {
            warn!("derivation failed: {err}");
            return;
        }
    };
    if cancel.is_cancelled() {
        debug!("derivation preempted before publish");
        return;
    }

    info!(
        root = %merkle.root_merkle_id,
        version = merkle.version,
        nodes = merkle.merkle_graph.len(),
        "publishing Merkle DAG"
    );
    let check = merkle.to_dag();
    service.publish(merkle);
    if let Err(err) = check.validate() {
        warn!("published Merkle DAG does not reconstruct a valid DAG: {err:#}");
    }
}

/// Load the DAG once, then keep rederiving on every write to `path` until
/// `cancel` fires.
pub async fn watch(
    service: Service,
    path: impl Into<PathBuf>,
    cancel: CancellationToken,
) -> Result<()> {
    let path = path.into();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
        let _ = tx.send(event);
    })?;
    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", path.display()))?;

    let mut reloader = Reloader::new(service, path);
    reloader.trigger();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(Ok(event)) if is_write(&event) => reloader.trigger(),
                Some(Ok(_)) => {}
                Some(Err(err)) => warn!("watch error: {err}"),
                None => break,
            },
        }
    }
    Ok(())
}

fn is_write(event: &Event) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
}

pub fn router(service: Service) -> Router {
    Router::new()
        .route("/root", get(root))
        .route("/sources", get(sources))
        .route("/query", get(query))
        .route("/payload", get(payload))
        .with_state(service)
}

/// Serve the four read operations on `listener` until `cancel` fires.
pub async fn serve(
    service: Service,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    axum::serve(listener, router(service))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

/// Watch `path` and serve the derived Merkle DAG on `addr` until `cancel`
/// fires.
pub async fn run(path: PathBuf, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let service = Service::new();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {}", listener.local_addr()?);

    let watcher = tokio::spawn(watch(service.clone(), path, cancel.clone()));
    serve(service, listener, cancel).await?;
    watcher.await??;
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorMessage {
            message: message.into(),
        }),
    )
        .into_response()
}

async fn root(State(service): State<Service>) -> Response {
    service.metrics().root.inc();
    match service.root() {
        Some((id, version)) => Json(RootResponse { id, version }).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Root not found"),
    }
}

async fn sources(
    State(service): State<Service>,
    body: Result<Json<SourcesRequest>, JsonRejection>,
) -> Response {
    service.metrics().sources.inc();
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let Some((current_root, _)) = service.root() else {
        return error_response(StatusCode::NOT_FOUND, "Root not found");
    };
    if current_root != req.id {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("Root mismatch, current root: {current_root}"),
        );
    }

    let sources = service.sources();
    Json(SourcesResponse {
        size: sources.len(),
        sources: sources.iter().map(SourceEntry::from).collect(),
    })
    .into_response()
}

async fn query(
    State(service): State<Service>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    service.metrics().query.inc();
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    Json(service.query(&req)).into_response()
}

async fn payload(
    State(service): State<Service>,
    body: Result<Json<PayloadRequest>, JsonRejection>,
) -> Response {
    service.metrics().payload.inc();
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    if req.payload_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "payload_id is empty");
    }
    match service.payload(&req.payload_id) {
        Some(payload) => Json(crate::protocol::PayloadResponse { payload }).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Payload not found"),
    }
}
