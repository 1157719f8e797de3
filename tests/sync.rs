//! End-to-end sync scenarios: a real observable served over HTTP, a real
//! observer polling it, a DAG file mutated underneath.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use url::Url;

use dagsync::dag::{Dag, DagConfig};
use dagsync::merkle::{self, MerkleDag};
use dagsync::observable::{self, Service};
use dagsync::observer::{Observer, ObserverState};

const SYNC_TIMEOUT: Duration = Duration::from_secs(20);
const POLL: Duration = Duration::from_millis(200);

fn config(num_nodes: usize, num_sources: usize) -> DagConfig {
    DagConfig {
        num_nodes,
        num_sources,
        random_degree: 5,
        payload_size: 10,
    }
}

struct Publisher {
    dir: tempfile::TempDir,
    path: PathBuf,
    service: Service,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl Publisher {
    async fn start(dag: &mut Dag) -> Publisher {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("from.json");
        dag.write_to(&path).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::start_with(dir, path, listener)
    }

    /// Restart on the same file and address, as a process restart would.
    async fn restart(dir: tempfile::TempDir, path: PathBuf, addr: SocketAddr) -> Publisher {
        let listener = bind_retry(addr).await;
        Self::start_with(dir, path, listener)
    }

    fn start_with(dir: tempfile::TempDir, path: PathBuf, listener: TcpListener) -> Publisher {
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let service = Service::new();
        tokio::spawn(observable::watch(
            service.clone(),
            path.clone(),
            cancel.clone(),
        ));
        tokio::spawn(observable::serve(service.clone(), listener, cancel.clone()));
        Publisher {
            dir,
            path,
            service,
            addr,
            cancel,
        }
    }

    fn endpoint(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    fn rewrite(&self, dag: &mut Dag) {
        dag.write_to(&self.path).unwrap();
    }

    fn shutdown(self) -> (tempfile::TempDir, PathBuf, SocketAddr) {
        self.cancel.cancel();
        (self.dir, self.path, self.addr)
    }

    async fn wait_for_publication(&self) -> String {
        timeout(SYNC_TIMEOUT, async {
            loop {
                if let Some((root, _)) = self.service.root() {
                    return root;
                }
                sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("observable did not publish in time")
    }
}

async fn bind_retry(addr: SocketAddr) -> TcpListener {
    for _ in 0..100 {
        if let Ok(listener) = TcpListener::bind(addr).await {
            return listener;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("failed to rebind {addr}");
}

struct Follower {
    state: ObserverState,
    done: broadcast::Receiver<Arc<MerkleDag>>,
    cancel: CancellationToken,
}

fn start_follower(endpoint: Url) -> Follower {
    let observer = Observer::new(endpoint).unwrap().with_poll_interval(POLL);
    let state = observer.state();
    let done = observer.subscribe();
    let cancel = CancellationToken::new();
    tokio::spawn(observer.run(cancel.clone()));
    Follower {
        state,
        done,
        cancel,
    }
}

fn expected_root(path: &Path) -> String {
    let dag = Dag::read_from(path).unwrap();
    merkle::generate(&dag, &CancellationToken::new())
        .unwrap()
        .root_merkle_id
}

async fn wait_for_done(follower: &mut Follower, root: &str) -> Arc<MerkleDag> {
    timeout(SYNC_TIMEOUT, async {
        loop {
            match follower.done.recv().await {
                Ok(dag) if dag.root_merkle_id == root => return dag,
                Ok(_) => continue,
                Err(err) => panic!("done channel closed: {err}"),
            }
        }
    })
    .await
    .expect("sync did not complete in time")
}

async fn wait_for_installed(state: &ObserverState, root: &str) {
    timeout(SYNC_TIMEOUT, async {
        loop {
            if state.root_merkle_id().as_deref() == Some(root) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("observer did not install the expected root in time")
}

#[tokio::test(flavor = "multi_thread")]
async fn cold_sync_converges() {
    let mut dag = Dag::generate(&config(100, 5)).unwrap();
    let publisher = Publisher::start(&mut dag).await;
    let mut follower = start_follower(publisher.endpoint());

    let root = expected_root(&publisher.path);
    let synced = wait_for_done(&mut follower, &root).await;
    assert_eq!(synced.to_dag(), dag.clone().sorted());
    assert_eq!(follower.state.root_merkle_id().unwrap(), root);

    follower.cancel.cancel();
    publisher.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn unchanged_republish_causes_no_fetches() {
    let mut dag = Dag::generate(&config(100, 5)).unwrap();
    let publisher = Publisher::start(&mut dag).await;
    let mut follower = start_follower(publisher.endpoint());

    let root = expected_root(&publisher.path);
    wait_for_done(&mut follower, &root).await;

    let metrics = publisher.service.metrics();
    let roots = metrics.root.get();
    let queries = metrics.query.get();
    let payloads = metrics.payload.get();

    // Byte-identical rewrite: the observable rederives, the root does not
    // move, the follower must not fetch anything.
    publisher.rewrite(&mut dag);
    sleep(Duration::from_millis(1500)).await;

    assert_eq!(metrics.query.get(), queries);
    assert_eq!(metrics.payload.get(), payloads);
    assert!(metrics.root.get() > roots, "follower should keep polling");
    assert_eq!(follower.state.root_merkle_id().unwrap(), root);

    follower.cancel.cancel();
    publisher.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn additive_change_fetches_only_new_payloads() {
    let mut dag = Dag::generate(&config(100, 5)).unwrap();
    let publisher = Publisher::start(&mut dag).await;
    let mut follower = start_follower(publisher.endpoint());

    wait_for_done(&mut follower, &expected_root(&publisher.path)).await;

    let metrics = publisher.service.metrics();
    let queries = metrics.query.get();
    let payloads = metrics.payload.get();

    dag.add_random_nodes(5, &config(100, 5)).unwrap();
    publisher.rewrite(&mut dag);

    let root = expected_root(&publisher.path);
    let synced = wait_for_done(&mut follower, &root).await;
    assert_eq!(synced.to_dag(), dag.clone().sorted());

    // Exactly the five inserted payloads cross the wire; everything else is
    // migrated or copied from the installed state.
    assert_eq!(metrics.payload.get() - payloads, 5);
    assert!(metrics.query.get() > queries);

    follower.cancel.cancel();
    publisher.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn mid_sync_preemption_lands_on_the_newest_revision() {
    let mut dag = Dag::generate(&config(300, 5)).unwrap();
    let publisher = Publisher::start(&mut dag).await;
    let mut follower = start_follower(publisher.endpoint());

    wait_for_done(&mut follower, &expected_root(&publisher.path)).await;

    // Two rapid revisions; the second lands while the first may still be
    // syncing.
    dag.update_random_nodes(20, &config(300, 5)).unwrap();
    publisher.rewrite(&mut dag);
    sleep(Duration::from_millis(250)).await;
    dag.update_random_nodes(20, &config(300, 5)).unwrap();
    publisher.rewrite(&mut dag);

    let root = expected_root(&publisher.path);
    wait_for_installed(&follower.state, &root).await;
    let installed = follower.state.current().unwrap();
    assert_eq!(installed.to_dag(), dag.clone().sorted());

    follower.cancel.cancel();
    publisher.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn source_only_restart_triggers_no_sync_work() {
    let mut dag = Dag::generate(&config(100, 5)).unwrap();
    let publisher = Publisher::start(&mut dag).await;
    let mut follower = start_follower(publisher.endpoint());

    let root = expected_root(&publisher.path);
    wait_for_done(&mut follower, &root).await;

    let (dir, path, addr) = publisher.shutdown();
    let publisher = Publisher::restart(dir, path, addr).await;

    // Same file, so the restarted observable publishes the same root.
    assert_eq!(publisher.wait_for_publication().await, root);

    sleep(Duration::from_millis(1500)).await;
    let metrics = publisher.service.metrics();
    assert!(metrics.root.get() > 0, "follower should be polling again");
    assert_eq!(metrics.sources.get(), 0);
    assert_eq!(metrics.query.get(), 0);
    assert_eq!(metrics.payload.get(), 0);
    assert_eq!(follower.state.root_merkle_id().unwrap(), root);

    follower.cancel.cancel();
    publisher.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn single_update_migrates_everything_else() {
    let mut dag = Dag::generate(&config(80, 4)).unwrap();
    let publisher = Publisher::start(&mut dag).await;
    let mut follower = start_follower(publisher.endpoint());

    wait_for_done(&mut follower, &expected_root(&publisher.path)).await;

    let metrics = publisher.service.metrics();
    let payloads = metrics.payload.get();

    dag.update_random_nodes(1, &config(80, 4)).unwrap();
    publisher.rewrite(&mut dag);

    let root = expected_root(&publisher.path);
    let synced = wait_for_done(&mut follower, &root).await;
    assert_eq!(synced.to_dag(), dag.clone().sorted());

    // One changed payload, one fetch. The ancestor chain's Merkle ids all
    // changed, but their payloads are served from the installed state.
    assert_eq!(metrics.payload.get() - payloads, 1);

    follower.cancel.cancel();
    publisher.cancel.cancel();
}
