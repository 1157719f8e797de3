//! Merkle DAG derivation.
//!
//! Every payload node is assigned a Merkle identifier: the digest of the
//! sorted list holding its own payload identifier and the Merkle identifiers
//! of its direct successors. The identifier is therefore stable under
//! successor reordering and changes whenever anything in the reachable
//! sub-DAG changes, which is what lets an observer skip unchanged subgraphs
//! wholesale.
//!
//! Derivation walks each source with an explicit frame stack (deep chains
//! must not recurse on the host stack) and polls a cancellation token between
//! steps so a newer revision can preempt an in-flight derivation cheaply.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::dag::{Dag, Edge, Node, Source as DagSource};
use crate::digest::digest_sorted;

pub type MerkleId = String;
pub type PayloadId = String;
pub type Payload = String;

/// One payload node under one particular successor set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub merkle_id: MerkleId,
    pub payload_id: PayloadId,
}

/// The per-source Merkle root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub merkle_id: MerkleId,
    pub payload_id: PayloadId,
}

pub type MerkleGraph = HashMap<MerkleId, Vec<MerkleNode>>;
pub type PayloadMap = HashMap<PayloadId, Payload>;

/// A fully derived Merkle DAG. Immutable once published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleDag {
    /// Nondecreasing across publications; unix seconds at derivation.
    pub version: i64,
    pub root_merkle_id: MerkleId,
    pub merkle_graph: MerkleGraph,
    pub payload_map: PayloadMap,
    pub sources: Vec<Source>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerateError {
    #[error("derivation cancelled")]
    Cancelled,
    #[error("source {name} references unknown payload {payload_id}")]
    UnknownSource { name: String, payload_id: PayloadId },
    #[error("edge from {from} references unknown payload {to}")]
    UnknownPayload { from: PayloadId, to: PayloadId },
    #[error("cycle through payload {payload_id}")]
    Cycle { payload_id: PayloadId },
}

struct Frame<'a> {
    payload_id: &'a str,
    /// Successor payloads still to process.
    pending: Vec<&'a str>,
    /// Finalized children: Merkle id to payload id.
    done: HashMap<MerkleId, &'a str>,
}

impl<'a> Frame<'a> {
    fn new(payload_id: &'a str, pending: Vec<&'a str>) -> Self {
        Frame {
            payload_id,
            pending,
            done: HashMap::new(),
        }
    }

    fn merkle_id(&self) -> MerkleId {
        let mut ids: Vec<&str> = Vec::with_capacity(self.done.len() + 1);
        ids.push(self.payload_id);
        ids.extend(self.done.keys().map(String::as_str));
        digest_sorted(&mut ids)
    }
}

/// Derive the Merkle DAG for `dag`.
///
/// Deterministic: the result depends only on the payload relation, not on
/// container iteration order. Checks `cancel` once per stack step and returns
/// [`GenerateError::Cancelled`] without publishing anything if it fired.
pub fn generate(dag: &Dag, cancel: &CancellationToken) -> Result<MerkleDag, GenerateError> {
    let mut payload_graph: HashMap<&str, Vec<&str>> = HashMap::with_capacity(dag.nodes.len());
    let mut payload_map = PayloadMap::with_capacity(dag.nodes.len());
    for node in &dag.nodes {
        payload_map.insert(node.id.clone(), node.payload.clone());
    }
    for edge in &dag.edges {
        payload_graph
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }

    let mut sources = Vec::with_capacity(dag.sources.len());
    let mut visited: HashMap<&str, MerkleId> = HashMap::with_capacity(dag.nodes.len());
    let mut merkle_graph = MerkleGraph::with_capacity(dag.nodes.len());

    for source in &dag.sources {
        if !payload_map.contains_key(&source.id) {
            return Err(GenerateError::UnknownSource {
                name: source.name.clone(),
                payload_id: source.id.clone(),
            });
        }

        let mut stack = vec![Frame::new(
            &source.id,
            payload_graph.get(source.id.as_str()).cloned().unwrap_or_default(),
        )];
        let mut on_stack: HashSet<&str> = HashSet::from([source.id.as_str()]);
        let mut source_merkle_id = MerkleId::new();

        while let Some(frame) = stack.last_mut() {
            if cancel.is_cancelled() {
                return Err(GenerateError::Cancelled);
            }

            if !frame.pending.is_empty() {
                let next = frame.pending.pop().expect("pending is non-empty");
                if let Some(merkle_id) = visited.get(next) {
                    frame.done.insert(merkle_id.clone(), next);
                    continue;
                }
                if on_stack.contains(next) {
                    return Err(GenerateError::Cycle {
                        payload_id: next.to_string(),
                    });
                }
                if !payload_map.contains_key(next) {
                    return Err(GenerateError::UnknownPayload {
                        from: frame.payload_id.to_string(),
                        to: next.to_string(),
                    });
                }
                on_stack.insert(next);
                let pending = payload_graph.get(next).cloned().unwrap_or_default();
                stack.push(Frame::new(next, pending));
                continue;
            }

            // All successors finalized: this frame gets its Merkle id.
            let merkle_id = frame.merkle_id();
            visited.insert(frame.payload_id, merkle_id.clone());
            let children = frame
                .done
                .iter()
                .map(|(child_merkle_id, child_payload_id)| MerkleNode {
                    merkle_id: child_merkle_id.clone(),
                    payload_id: child_payload_id.to_string(),
                })
                .collect();
            merkle_graph.insert(merkle_id.clone(), children);
            on_stack.remove(frame.payload_id);

            let payload_id = frame.payload_id;
            stack.pop();
            match stack.last_mut() {
                Some(parent) => {
                    parent.done.insert(merkle_id, payload_id);
                }
                None => source_merkle_id = merkle_id,
            }
        }

        sources.push(Source {
            name: source.name.clone(),
            merkle_id: source_merkle_id,
            payload_id: source.id.clone(),
        });
    }

    let mut source_merkle_ids: Vec<&str> = sources.iter().map(|s| s.merkle_id.as_str()).collect();
    let root_merkle_id = digest_sorted(&mut source_merkle_ids);

    Ok(MerkleDag {
        version: unix_seconds(),
        root_merkle_id,
        merkle_graph,
        payload_map,
        sources,
    })
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

impl MerkleDag {
    /// Reconstruct the payload DAG, in canonical order.
    pub fn to_dag(&self) -> Dag {
        let mut node_map: HashMap<&PayloadId, Node> = HashMap::new();
        let mut merkle_to_payload: HashMap<&MerkleId, &PayloadId> =
            HashMap::with_capacity(self.merkle_graph.len());

        for items in self.merkle_graph.values() {
            for item in items {
                node_map.insert(
                    &item.payload_id,
                    Node {
                        id: item.payload_id.clone(),
                        payload: self
                            .payload_map
                            .get(&item.payload_id)
                            .cloned()
                            .unwrap_or_default(),
                    },
                );
                merkle_to_payload.insert(&item.merkle_id, &item.payload_id);
            }
        }
        for source in &self.sources {
            node_map.insert(
                &source.payload_id,
                Node {
                    id: source.payload_id.clone(),
                    payload: self
                        .payload_map
                        .get(&source.payload_id)
                        .cloned()
                        .unwrap_or_default(),
                },
            );
            merkle_to_payload.insert(&source.merkle_id, &source.payload_id);
        }

        let mut edges = Vec::new();
        for (merkle_id, items) in &self.merkle_graph {
            for item in items {
                if let Some(from) = merkle_to_payload.get(merkle_id) {
                    edges.push(Edge {
                        from: (*from).clone(),
                        to: item.payload_id.clone(),
                    });
                }
            }
        }

        let mut dag = Dag {
            nodes: node_map.into_values().collect(),
            edges,
            sources: self
                .sources
                .iter()
                .map(|source| DagSource {
                    name: source.name.clone(),
                    id: source.payload_id.clone(),
                })
                .collect(),
        };
        dag.sort();
        dag
    }
}
