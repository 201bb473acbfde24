use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_latch::AsyncLatch;
use flag_store::FlagStore;
use petgraph::graph::DiGraph;
use serde_json::Map;
use task_executor::Executor;

use crate::metrics::{format_secs, Metrics};
use crate::node::{LatchTable, Node, NodeId, NodeSpec, Record};
use crate::output::{Output, OutputHandle};

///
/// A directed acyclic graph of nodes, built once via `add_node` and invoked many times via
/// `run`. Carries a sentinel root used only to discover reachable nodes; the root is never a
/// barrier parent of the nodes attached to it.
///
pub struct Graph {
    root: NodeId,
    pg: DiGraph<Arc<Node>, ()>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Graph {
        let mut pg = DiGraph::new();
        let root = pg.add_node(Arc::new(Node {
            name: "root".to_string(),
            parents: Vec::new(),
            feature_flag: None,
            predicate: None,
            work: None,
            kwargs: Map::new(),
        }));
        Graph { root, pg }
    }

    /// The sentinel root node's id, usable as a discovery anchor by callers that build the
    /// graph incrementally.
    pub fn root(&self) -> NodeId {
        self.root
    }

    ///
    /// Adds a node whose barrier dependencies are exactly `parents`. When `parents` is empty, a
    /// discovery-only edge from the root is added so the node is still reachable by traversal;
    /// the root is never added to the node's own `parents`.
    ///
    pub fn add_node(&mut self, spec: NodeSpec, parents: &[NodeId]) -> NodeId {
        let id = self.pg.add_node(Arc::new(Node {
            name: spec.name,
            parents: parents.to_vec(),
            feature_flag: spec.feature_flag,
            predicate: spec.predicate,
            work: spec.work,
            kwargs: spec.kwargs,
        }));

        if parents.is_empty() {
            self.pg.add_edge(self.root, id, ());
        } else {
            for &parent in parents {
                self.pg.add_edge(parent, id, ());
            }
        }

        id
    }

    ///
    /// Drives one record through the graph: discovers reachable nodes from the root, schedules
    /// one task per non-root node, and merges their metrics once every task has completed.
    ///
    pub async fn run(&self, record: Record, flags: &FlagStore, executor: &Executor) -> (Metrics, Output) {
        let total_start = Instant::now();
        let output = Output::new();

        let mut latches: LatchTable = HashMap::with_capacity(self.pg.node_count());
        for idx in self.pg.node_indices() {
            latches.insert(idx, AsyncLatch::new());
        }
        let latches = Arc::new(latches);

        let visit_order = self.discover();

        let mut handles = Vec::with_capacity(visit_order.len());
        for id in visit_order {
            if id == self.root {
                latches
                    .get(&id)
                    .expect("latch table missing entry for the root node")
                    .trigger();
                continue;
            }

            let node = Arc::clone(&self.pg[id]);
            let record = record.clone();
            let output_handle = output.handle();
            let flags = flags.clone();
            let executor_for_node = executor.clone();
            let latches = Arc::clone(&latches);

            handles.push(executor.native_spawn(async move {
                node.run(record, output_handle, flags, executor_for_node, latches, id)
                    .await
            }));
        }

        let mut merged = Metrics::new();
        for handle in handles {
            match handle.await {
                Ok(metrics) => merged.extend(metrics),
                Err(join_err) => {
                    log::warn!("a node task was lost before reporting its metrics: {join_err}");
                }
            }
        }
        merged.insert("dag.execution".to_string(), format_secs(total_start.elapsed()));

        (merged, output)
    }

    /// Breadth-first discovery of every node reachable from the root, including the root itself.
    fn discover(&self) -> Vec<NodeId> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();

        queue.push_back(self.root);
        visited.insert(self.root);

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for child in self.pg.neighbors(id) {
                if visited.insert(child) {
                    queue.push_back(child);
                }
            }
        }

        order
    }
}
