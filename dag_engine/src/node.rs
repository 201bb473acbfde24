use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use flag_store::FlagStore;
use serde_json::{Map, Value};
use task_executor::Executor;

use crate::metrics::{format_secs, Metrics};
use crate::output::OutputHandle;

pub type NodeId = petgraph::graph::NodeIndex<u32>;
pub type Record = Value;
pub type Kwargs = Map<String, Value>;
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub(crate) type LatchTable = HashMap<NodeId, async_latch::AsyncLatch>;

/// The error type returned by a node's work function. Carries a human-readable message only,
/// since the engine's sole failure-reporting channel is the flat metrics bundle.
#[derive(Debug, Clone)]
pub struct WorkError(String);

impl WorkError {
    pub fn new(message: impl Into<String>) -> WorkError {
        WorkError(message.into())
    }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for WorkError {}

type AsyncWorkFn =
    dyn Fn(Record, OutputHandle, Kwargs) -> BoxFuture<'static, Result<(), WorkError>> + Send + Sync;
type BlockingWorkFn = dyn Fn(Record, OutputHandle, Kwargs) -> Result<(), WorkError> + Send + Sync;

/// A node's unit of work: either driven cooperatively alongside the rest of the runtime, or
/// offloaded to the blocking threadpool.
#[derive(Clone)]
pub enum Work {
    Async(Arc<AsyncWorkFn>),
    Blocking(Arc<BlockingWorkFn>),
}

pub type Predicate = Arc<dyn Fn(&Record, &OutputHandle) -> bool + Send + Sync>;

/// A builder for one node's topology. Handed to `Graph::add_node`, which fixes its identity.
#[derive(Clone)]
pub struct NodeSpec {
    pub(crate) name: String,
    pub(crate) feature_flag: Option<String>,
    pub(crate) predicate: Option<Predicate>,
    pub(crate) work: Option<Work>,
    pub(crate) kwargs: Kwargs,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> NodeSpec {
        NodeSpec {
            name: name.into(),
            feature_flag: None,
            predicate: None,
            work: None,
            kwargs: Kwargs::new(),
        }
    }

    pub fn with_feature_flag(mut self, flag: impl Into<String>) -> Self {
        self.feature_flag = Some(flag.into());
        self
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_async_work(mut self, work: Arc<AsyncWorkFn>) -> Self {
        self.work = Some(Work::Async(work));
        self
    }

    pub fn with_blocking_work(mut self, work: Arc<BlockingWorkFn>) -> Self {
        self.work = Some(Work::Blocking(work));
        self
    }

    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }
}

/// A vertex in a `Graph`. Immutable once constructed; `Graph::run` never mutates a `Node`.
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) parents: Vec<NodeId>,
    pub(crate) feature_flag: Option<String>,
    pub(crate) predicate: Option<Predicate>,
    pub(crate) work: Option<Work>,
    pub(crate) kwargs: Kwargs,
}

struct TriggerOnDrop<'a>(&'a async_latch::AsyncLatch);

impl Drop for TriggerOnDrop<'_> {
    fn drop(&mut self) {
        self.0.trigger();
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "predicate panicked".to_string()
    }
}

async fn dispatch(
    work: &Work,
    record: Record,
    output: OutputHandle,
    kwargs: Kwargs,
    executor: &Executor,
) -> Result<(), WorkError> {
    match work {
        Work::Async(f) => {
            let f = Arc::clone(f);
            let future = f(record, output, kwargs);
            executor
                .spawn(future, |join_err| {
                    Err(WorkError::new(format!("node task panicked: {join_err}")))
                })
                .await
        }
        Work::Blocking(f) => {
            let f = Arc::clone(f);
            executor
                .spawn_blocking(move || f(record, output, kwargs), |join_err| {
                    Err(WorkError::new(format!("node task panicked: {join_err}")))
                })
                .await
        }
    }
}

impl Node {
    /// Runs this node once for one record: awaits its parents, evaluates its gates, dispatches
    /// its work, and unconditionally signals completion on every exit path.
    pub(crate) async fn run(
        self: Arc<Self>,
        record: Record,
        output: OutputHandle,
        flags: FlagStore,
        executor: Executor,
        latches: Arc<LatchTable>,
        my_id: NodeId,
    ) -> Metrics {
        let mut metrics = Metrics::new();

        let my_latch = latches
            .get(&my_id)
            .expect("latch table missing entry for this node")
            .clone();
        let _trigger_on_exit = TriggerOnDrop(&my_latch);

        let awaiting_parents = if !self.parents.is_empty() {
            let wait_start = Instant::now();
            let waits = self.parents.iter().map(|parent| {
                let latch = latches
                    .get(parent)
                    .expect("latch table missing entry for a parent node")
                    .clone();
                async move { latch.triggered().await }
            });
            futures::future::join_all(waits).await;
            Some(format_secs(wait_start.elapsed()))
        } else {
            None
        };

        let gate_start = Instant::now();

        if let Some(flag) = &self.feature_flag {
            if !flags.is_enabled(flag) {
                metrics.insert(format!("{}.feature_flag", self.name), "False".to_string());
                return metrics;
            }
        }

        if let Some(predicate) = &self.predicate {
            let predicate = Arc::clone(predicate);
            let record_for_predicate = record.clone();
            let output_for_predicate = output.clone();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                predicate(&record_for_predicate, &output_for_predicate)
            }));
            match outcome {
                Ok(true) => {}
                Ok(false) => {
                    metrics.insert(format!("{}.exe_condition", self.name), "False".to_string());
                    return metrics;
                }
                Err(panic) => {
                    log::warn!("node {} predicate panicked", self.name);
                    metrics.insert(format!("{}.exception", self.name), panic_message(panic));
                    return metrics;
                }
            }
        }

        if let Some(work) = &self.work {
            let result = dispatch(work, record, output, self.kwargs.clone(), &executor).await;
            match result {
                Ok(()) => {
                    if let Some(awaiting_parents) = awaiting_parents {
                        metrics.insert(format!("{}.awaiting_parents", self.name), awaiting_parents);
                    }
                    metrics.insert(
                        format!("{}.execution", self.name),
                        format_secs(gate_start.elapsed()),
                    );
                }
                Err(err) => {
                    log::warn!("node {} failed: {err}", self.name);
                    metrics.insert(format!("{}.exception", self.name), err.to_string());
                }
            }
        } else if let Some(awaiting_parents) = awaiting_parents {
            metrics.insert(format!("{}.awaiting_parents", self.name), awaiting_parents);
        }

        metrics
    }
}
