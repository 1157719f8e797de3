//! The payload DAG: the observable's source of truth.
//!
//! Nodes are content-addressed (the node id is the digest of the payload
//! bytes), edges are directed and deduplicated, and the declared sources are
//! exactly the in-degree-0 nodes. The synthetic generator and the three
//! mutators exist for the test harness and the fixture CLI; the sync path
//! only ever reads this structure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use crate::digest::digest_bytes;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// A named in-degree-0 node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dag {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub sources: Vec<Source>,
}

/// Tunables for the synthetic generator and mutators.
#[derive(Debug, Clone, Copy)]
pub struct DagConfig {
    pub num_nodes: usize,
    pub num_sources: usize,
    /// Extra random in/out edges attempted per node.
    pub random_degree: usize,
    /// Payload size in bytes, pre base64.
    pub payload_size: usize,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            num_nodes: 10_000,
            num_sources: 5,
            random_degree: 5,
            payload_size: 100,
        }
    }
}

impl Dag {
    /// Generate a random DAG satisfying the structural contract: the first
    /// `num_sources` generated nodes are the sources, every source has at
    /// least one outgoing edge, every other node at least one incoming edge,
    /// and no edge points at a source.
    pub fn generate(config: &DagConfig) -> Result<Dag> {
        ensure!(config.num_nodes > 0, "num_nodes must be greater than 0");
        ensure!(config.num_sources > 0, "num_sources must be greater than 0");
        ensure!(
            config.num_sources < config.num_nodes,
            "num_sources must be less than num_nodes"
        );
        ensure!(
            config.random_degree > 0,
            "random_degree must be greater than 0"
        );
        ensure!(
            config.payload_size > 0,
            "payload_size must be greater than 0"
        );

        let mut rng = rand::thread_rng();
        let nodes: Vec<Node> = (0..config.num_nodes)
            .map(|_| random_node(&mut rng, config.payload_size))
            .collect();

        let mut edges = Vec::new();
        // Every source gets at least one out-edge.
        for i in 0..config.num_sources {
            let target = config.num_sources + rng.gen_range(0..config.num_nodes - config.num_sources);
            edges.push(Edge {
                from: nodes[i].id.clone(),
                to: nodes[target].id.clone(),
            });
        }
        // Every non-source node gets at least one in-edge from an earlier node.
        for i in config.num_sources..config.num_nodes {
            let from = rng.gen_range(0..i);
            edges.push(Edge {
                from: nodes[from].id.clone(),
                to: nodes[i].id.clone(),
            });
        }
        // Extra random edges, always earlier -> later, never into a source.
        for i in 0..nodes.len() {
            for _ in 0..rng.gen_range(0..config.random_degree) {
                let target = rng.gen_range(0..nodes.len());
                let (from, to) = if target < i { (target, i) } else { (i, target) };
                if from == to || to < config.num_sources {
                    continue;
                }
                edges.push(Edge {
                    from: nodes[from].id.clone(),
                    to: nodes[to].id.clone(),
                });
            }
        }
        dedup_edges(&mut edges);

        let sources = nodes[..config.num_sources]
            .iter()
            .map(|node| Source {
                name: format!("Source-{}", node.id),
                id: node.id.clone(),
            })
            .collect();

        let mut dag = Dag {
            nodes,
            edges,
            sources,
        };
        dag.sort();
        Ok(dag)
    }

    /// Canonical order: nodes and sources by id, edges by (from, to).
    pub fn sort(&mut self) {
        self.nodes.sort_by(|a, b| a.id.cmp(&b.id));
        self.edges
            .sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        self.sources.sort_by(|a, b| a.id.cmp(&b.id));
    }

    /// Consuming variant of [`Dag::sort`] for comparisons.
    pub fn sorted(mut self) -> Dag {
        self.sort();
        self
    }

    /// Check the structural contract: known edge endpoints, exactly
    /// `|sources|` in-degree-0 nodes (and they are the declared sources),
    /// and no cycles.
    pub fn validate(&self) -> Result<()> {
        let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for node in &self.nodes {
            graph.insert(&node.id, Vec::new());
            in_degree.insert(&node.id, 0);
        }

        for edge in &self.edges {
            let Some(successors) = graph.get_mut(edge.from.as_str()) else {
                bail!("edge references unknown node {}", edge.from);
            };
            successors.push(&edge.to);
            let Some(count) = in_degree.get_mut(edge.to.as_str()) else {
                bail!("edge references unknown node {}", edge.to);
            };
            *count += 1;
        }

        let source_ids: HashSet<&str> = self.sources.iter().map(|s| s.id.as_str()).collect();
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        ensure!(
            queue.len() == self.sources.len(),
            "expected {} in-degree-0 nodes, found {}",
            self.sources.len(),
            queue.len()
        );
        for id in &queue {
            ensure!(source_ids.contains(id), "in-degree-0 node {id} is not a declared source");
        }

        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for &next in &graph[id] {
                let count = in_degree.get_mut(next).expect("endpoint checked above");
                *count -= 1;
                if *count == 0 {
                    queue.push_back(next);
                }
            }
        }
        ensure!(
            visited == self.nodes.len(),
            "graph has a cycle, visited {visited} of {} nodes",
            self.nodes.len()
        );
        Ok(())
    }

    /// Insert `times` random non-source nodes, each with at least one in-edge
    /// from a topologically earlier node.
    pub fn add_random_nodes(&mut self, times: usize, config: &DagConfig) -> Result<()> {
        self.topological_sort()?;
        let mut rng = rand::thread_rng();
        let num_sources = self.sources.len();

        for _ in 0..times {
            let node = random_node(&mut rng, config.payload_size);
            let id = node.id.clone();
            let position = num_sources + rng.gen_range(0..self.nodes.len() + 1 - num_sources);
            self.nodes.insert(position, node);

            // At least one in-degree from an earlier node.
            let from = rng.gen_range(0..position);
            self.edges.push(Edge {
                from: self.nodes[from].id.clone(),
                to: id.clone(),
            });

            for _ in 0..rng.gen_range(0..config.random_degree) {
                let target = rng.gen_range(0..self.nodes.len());
                let (from, to) = if target < position {
                    (target, position)
                } else {
                    (position, target)
                };
                if from == to || to < num_sources {
                    continue;
                }
                self.edges.push(Edge {
                    from: self.nodes[from].id.clone(),
                    to: self.nodes[to].id.clone(),
                });
            }
        }

        dedup_edges(&mut self.edges);
        Ok(())
    }

    /// Replace the payload (and therefore the id) of `times` random
    /// non-source nodes, rewriting edge endpoints to the new id.
    pub fn update_random_nodes(&mut self, times: usize, config: &DagConfig) -> Result<()> {
        ensure!(
            self.sources.len() < self.nodes.len(),
            "nothing to update, every node is a source"
        );
        self.topological_sort()?;
        let mut rng = rand::thread_rng();

        for _ in 0..times {
            let index = self.sources.len() + rng.gen_range(0..self.nodes.len() - self.sources.len());
            let replacement = random_node(&mut rng, config.payload_size);
            let prev_id = std::mem::replace(&mut self.nodes[index].id, replacement.id);
            self.nodes[index].payload = replacement.payload;

            let new_id = self.nodes[index].id.clone();
            for edge in &mut self.edges {
                if edge.from == prev_id {
                    edge.from = new_id.clone();
                }
                if edge.to == prev_id {
                    edge.to = new_id.clone();
                }
            }
        }
        Ok(())
    }

    /// Delete `times` random non-source nodes, re-linking every upstream
    /// neighbor to at least one downstream neighbor so reachability survives.
    pub fn delete_random_nodes(&mut self, times: usize) -> Result<()> {
        ensure!(
            times + self.sources.len() < self.nodes.len(),
            "cannot delete {times} nodes from a DAG with {} non-source nodes",
            self.nodes.len() - self.sources.len()
        );
        self.topological_sort()?;
        let mut rng = rand::thread_rng();

        let source_ids: HashSet<String> = self.sources.iter().map(|s| s.id.clone()).collect();
        let mut candidates: Vec<String> = self
            .nodes
            .iter()
            .filter(|node| !source_ids.contains(&node.id))
            .map(|node| node.id.clone())
            .collect();
        candidates.shuffle(&mut rng);

        for id in candidates.into_iter().take(times) {
            self.delete_node(&id, &mut rng);
        }
        dedup_edges(&mut self.edges);
        Ok(())
    }

    fn delete_node(&mut self, id: &str, rng: &mut impl Rng) {
        self.nodes.retain(|node| node.id != id);

        let mut upstream = Vec::new();
        let mut downstream = Vec::new();
        self.edges.retain(|edge| {
            if edge.to == id {
                upstream.push(edge.from.clone());
                false
            } else if edge.from == id {
                downstream.push(edge.to.clone());
                false
            } else {
                true
            }
        });
        if upstream.is_empty() || downstream.is_empty() {
            return;
        }

        upstream.shuffle(rng);
        downstream.shuffle(rng);

        // Every upstream node keeps a path down; every downstream node keeps
        // an in-edge.
        for (i, from) in upstream.iter().enumerate() {
            self.edges.push(Edge {
                from: from.clone(),
                to: downstream[i % downstream.len()].clone(),
            });
        }
        for (i, to) in downstream.iter().enumerate().skip(upstream.len()) {
            self.edges.push(Edge {
                from: upstream[i % upstream.len()].clone(),
                to: to.clone(),
            });
        }
    }

    /// Reorder `nodes` topologically, sources first. Fails on a cycle.
    fn topological_sort(&mut self) -> Result<()> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            *in_degree.entry(&edge.to).or_default() += 1;
            graph.entry(&edge.from).or_default().push(&edge.to);
        }

        let mut queue: VecDeque<&str> = self.sources.iter().map(|s| s.id.as_str()).collect();
        let mut order: Vec<String> = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for &next in graph.get(id).into_iter().flatten() {
                let count = in_degree.get_mut(next).expect("edge target counted");
                *count -= 1;
                if *count == 0 {
                    queue.push_back(next);
                }
            }
        }
        ensure!(
            order.len() == self.nodes.len(),
            "graph has a cycle, ordered {} of {} nodes",
            order.len(),
            self.nodes.len()
        );

        let mut by_id: HashMap<String, Node> = self
            .nodes
            .drain(..)
            .map(|node| (node.id.clone(), node))
            .collect();
        self.nodes = order
            .into_iter()
            .map(|id| by_id.remove(&id).expect("ordered node exists"))
            .collect();
        Ok(())
    }

    /// Load a DAG from a JSON file.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Dag> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read DAG from {}", path.display()))?;
        let dag = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to decode DAG from {}", path.display()))?;
        Ok(dag)
    }

    /// Write the DAG to a JSON file in canonical order, creating parent
    /// directories as needed.
    pub fn write_to(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.sort();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
        }
        let data = serde_json::to_vec_pretty(self).context("failed to encode DAG")?;
        fs::write(path, data)
            .with_context(|| format!("failed to write DAG to {}", path.display()))?;
        Ok(())
    }
}

fn random_node(rng: &mut impl Rng, payload_size: usize) -> Node {
    let mut bytes = vec![0u8; payload_size];
    rng.fill_bytes(&mut bytes);
    Node {
        id: digest_bytes(&bytes),
        payload: BASE64.encode(&bytes),
    }
}

fn dedup_edges(edges: &mut Vec<Edge>) {
    let mut seen = HashSet::new();
    edges.retain(|edge| seen.insert(edge.clone()));
}
