mod node;
mod setup;

pub use crate::graph::{node::Node, setup::GraphError};
pub(crate) use crate::graph::node::{Firing, Slot};
use crate::{
    config::Config,
    error::{Error, ExecutionError, SchedulingError},
    pool::Tagged,
    types::{HashMap, NodeId, ObjectId, PayloadOf, WorkResult},
    work::Work,
};
use derive_more::Debug;

/// A directed acyclic graph of computation nodes.
///
/// The graph owns its nodes in an arena; edges are ordered lists of
/// [`NodeId`]s on both ends. Every mutation is validated eagerly, so a graph
/// never contains a cycle. Before execution the graph is frozen with
/// [`freeze`](Self::freeze), which re-validates it, computes a topological
/// order and allocates the buffer pools; a frozen graph rejects further
/// mutation with [`GraphError::GraphFrozen`].
///
/// ```
/// use pipegraph::{config::Config, graph::Graph};
///
/// struct Ints;
/// impl Config for Ints {
///     type Payload = i64;
/// }
///
/// let mut graph = Graph::<Ints>::new();
/// let a = graph.add_source("a").unwrap();
/// let b = graph.add_node("b", |x: &[i64]| Ok(x[0] + 1)).unwrap();
/// graph.precede(a, b).unwrap();
/// assert_eq!(graph.input_nodes(), [a]);
/// assert_eq!(graph.output_nodes(), [b]);
/// assert!(graph.precede(b, a).is_err());
/// ```
#[derive(Debug)]
pub struct Graph<C: Config> {
    nodes: Vec<Node<C>>,
    #[debug(skip)]
    names: HashMap<String, NodeId>,
    order: Vec<NodeId>,
    sources: Vec<NodeId>,
    sinks: Vec<NodeId>,
    depth: Option<usize>,
}

impl<C: Config> Default for Graph<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Config> Graph<C> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            names: HashMap::default(),
            order: Vec::new(),
            sources: Vec::new(),
            sinks: Vec::new(),
            depth: None,
        }
    }

    /// Add a node computing its output from one payload per predecessor.
    ///
    /// # Errors
    /// If the graph is frozen, the name is taken or the graph is full.
    pub fn add_node<F>(&mut self, name: impl Into<String>, work: F) -> Result<NodeId, GraphError>
    where
        F: Fn(&[PayloadOf<C>]) -> WorkResult<PayloadOf<C>> + Send + Sync + 'static,
    {
        self.insert(name.into(), Some(Box::new(work)))
    }

    /// Add a node driven by a [`Work`] implementation.
    ///
    /// # Errors
    /// Same as [`add_node`](Self::add_node).
    pub fn add_work(
        &mut self,
        name: impl Into<String>,
        work: impl Work<PayloadOf<C>> + 'static,
    ) -> Result<NodeId, GraphError> {
        self.insert(name.into(), Some(Box::new(work)))
    }

    /// Add a node without a callback. As an input node it forwards the payload
    /// given to `run`; otherwise it forwards its single predecessor's output.
    ///
    /// # Errors
    /// Same as [`add_node`](Self::add_node).
    pub fn add_source(&mut self, name: impl Into<String>) -> Result<NodeId, GraphError> {
        self.insert(name.into(), None)
    }

    fn insert(
        &mut self,
        name: String,
        work: Option<Box<dyn Work<PayloadOf<C>>>>,
    ) -> Result<NodeId, GraphError> {
        self.ensure_mutable()?;
        if self.names.contains_key(&name) {
            return Err(GraphError::DuplicateName(name));
        }
        let id = NodeId(
            self.nodes
                .len()
                .try_into()
                .map_err(|_| GraphError::TooManyNodes)?,
        );
        if id.0 == u16::MAX {
            return Err(GraphError::TooManyNodes);
        }
        self.names.insert(name.clone(), id);
        self.nodes.push(Node::new(id, name, work));
        Ok(id)
    }

    /// Add the edge `from -> to`: `from`'s output becomes the next input of
    /// `to`.
    ///
    /// # Errors
    /// If either node is unknown, the edge exists already, the edge would close
    /// a cycle, or the graph is frozen.
    pub fn precede(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.ensure_mutable()?;
        self.ensure_known(from)?;
        self.ensure_known(to)?;
        if from == to || self.reaches(to, from) {
            return Err(GraphError::CycleDetected);
        }
        if self.nodes[from.index()].successors().contains(&to) {
            return Err(GraphError::DuplicateEdge { from, to });
        }
        self.nodes[from.index()].push_successor(to);
        self.nodes[to.index()].push_predecessor(from);
        Ok(())
    }

    /// Whether `target` is reachable from `start` along edges.
    fn reaches(&self, start: NodeId, target: NodeId) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if std::mem::replace(&mut visited[id.index()], true) {
                continue;
            }
            stack.extend_from_slice(self.nodes[id.index()].successors());
        }
        false
    }

    /// Validate the graph and prepare it for execution with `pipeline_depth`
    /// runs in flight. Freezing an already frozen graph reallocates its pools,
    /// dropping any data they hold.
    ///
    /// # Errors
    /// If the graph is empty, contains a cycle, has a callback-less node with
    /// several predecessors, or `pipeline_depth` is out of range.
    pub fn freeze(&mut self, pipeline_depth: usize) -> Result<(), GraphError> {
        if pipeline_depth == 0 || pipeline_depth > usize::from(u16::MAX) {
            return Err(GraphError::InvalidPipelineDepth(pipeline_depth));
        }
        if self.nodes.is_empty() {
            return Err(GraphError::EmptyGraph);
        }
        if let Some(node) = self
            .nodes
            .iter()
            .find(|node| !node.has_work() && node.predecessors().len() > 1)
        {
            return Err(GraphError::AmbiguousPassThrough(node.id()));
        }
        let levels = setup::topological_levels(&self.nodes)?;
        for (&id, &level) in &levels {
            self.nodes[id.index()].allocate_pools(pipeline_depth, level);
        }
        self.order = levels.into_keys().collect();
        self.sources = self.collect(Node::is_source);
        self.sinks = self.collect(Node::is_sink);
        self.depth = Some(pipeline_depth);
        tracing::debug!(
            nodes = self.nodes.len(),
            sources = self.sources.len(),
            sinks = self.sinks.len(),
            pipeline_depth,
            "graph frozen"
        );
        Ok(())
    }

    /// Undo [`freeze`](Self::freeze) and drop every pool.
    pub(crate) fn thaw(&mut self) {
        self.nodes.iter_mut().for_each(Node::release_pools);
        self.order.clear();
        self.sources.clear();
        self.sinks.clear();
        self.depth = None;
    }

    fn collect(&self, pred: impl Fn(&Node<C>) -> bool) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| pred(node))
            .map(Node::id)
            .collect()
    }

    fn ensure_mutable(&self) -> Result<(), GraphError> {
        if self.is_frozen() {
            Err(GraphError::GraphFrozen)
        } else {
            Ok(())
        }
    }

    fn ensure_known(&self, id: NodeId) -> Result<(), GraphError> {
        if id.index() < self.nodes.len() {
            Ok(())
        } else {
            Err(GraphError::UnknownNode(id))
        }
    }

    /// Whether the graph is frozen.
    pub fn is_frozen(&self) -> bool {
        self.depth.is_some()
    }

    /// Pipeline depth the graph was frozen with.
    pub fn pipeline_depth(&self) -> Option<usize> {
        self.depth
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> &[Node<C>] {
        &self.nodes
    }

    /// The node with the given id.
    pub fn node(&self, id: NodeId) -> Option<&Node<C>> {
        self.nodes.get(id.index())
    }

    /// The node with the given name.
    pub fn node_by_name(&self, name: &str) -> Option<&Node<C>> {
        self.names.get(name).map(|id| &self.nodes[id.index()])
    }

    /// Nodes without predecessors, in insertion order.
    pub fn input_nodes(&self) -> Vec<NodeId> {
        if self.is_frozen() {
            self.sources.clone()
        } else {
            self.collect(Node::is_source)
        }
    }

    /// Nodes without successors, in insertion order.
    pub fn output_nodes(&self) -> Vec<NodeId> {
        if self.is_frozen() {
            self.sinks.clone()
        } else {
            self.collect(Node::is_sink)
        }
    }

    /// Topological order computed by [`freeze`](Self::freeze); empty before.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    pub(crate) fn sources(&self) -> &[NodeId] {
        &self.sources
    }

    pub(crate) fn num_sinks(&self) -> usize {
        self.sinks.len()
    }

    pub(crate) fn node_at(&self, id: NodeId) -> &Node<C> {
        &self.nodes[id.index()]
    }

    /// Match payloads to input nodes, one staged entry per input node.
    pub(crate) fn stage_inputs(
        &self,
        inputs: impl IntoIterator<Item = (NodeId, PayloadOf<C>)>,
    ) -> Result<Vec<(NodeId, Slot<C>)>, Error> {
        let mut staged: Vec<(NodeId, Slot<C>)> =
            self.sources.iter().map(|&id| (id, None)).collect();
        for (id, payload) in inputs {
            let node = self.node(id).ok_or(GraphError::UnknownNode(id))?;
            if !node.is_source() {
                return Err(SchedulingError::UnexpectedInput(id).into());
            }
            let slot = staged
                .iter_mut()
                .find(|(source, _)| *source == id)
                .expect("Graph::stage_inputs: [1]");
            if slot.1.replace(payload).is_some() {
                return Err(SchedulingError::DuplicateInput(id).into());
            }
        }
        if let Some((id, _)) = staged
            .iter()
            .find(|(id, payload)| payload.is_none() && !self.node_at(*id).has_work())
        {
            return Err(SchedulingError::MissingInput(*id).into());
        }
        Ok(staged)
    }

    /// Take the inputs of `id` for run `object_id` from the staging pool or
    /// the predecessors' pools, without waiting.
    ///
    /// Returns the first node whose entry is missing.
    pub(crate) fn take_inputs(
        &self,
        id: NodeId,
        object_id: ObjectId,
    ) -> Result<Vec<Slot<C>>, NodeId> {
        let node = self.node_at(id);
        if node.is_source() {
            let staged = node.input_pool().take_tagged(object_id).ok_or(id)?;
            return Ok(staged.payload.map(Some).into_iter().collect());
        }
        node.predecessors()
            .iter()
            .map(|&pred| {
                self.node_at(pred)
                    .pool_towards(id)
                    .take_tagged(object_id)
                    .map(|entry| entry.payload)
                    .ok_or(pred)
            })
            .collect()
    }

    /// Execute node `id` once for run `object_id` on the calling thread,
    /// bypassing any scheduler.
    ///
    /// Inputs are taken from the staging pool (input nodes) or from the
    /// predecessors' pools, the output is published to this node's pools. A
    /// sink's output is returned instead.
    ///
    /// # Errors
    /// If the graph is not frozen, the node is unknown, an input for the run
    /// is missing, or the callback fails.
    pub fn fire(
        &self,
        id: NodeId,
        object_id: ObjectId,
    ) -> Result<Option<PayloadOf<C>>, Error> {
        if !self.is_frozen() {
            return Err(GraphError::NotFrozen.into());
        }
        self.ensure_known(id)?;
        let inputs = self
            .take_inputs(id, object_id)
            .map_err(ExecutionError::NoInput)?;
        let node = self.node_at(id);
        let Firing {
            output,
            error,
            outgoing,
        } = node.fire(inputs, false);
        node.publish(object_id, outgoing);
        match error {
            Some(err) => Err(err.into()),
            None => Ok(output),
        }
    }

    /// Stage `payload` for input node `id` as run `object_id`.
    ///
    /// # Errors
    /// If the graph is not frozen, the node is unknown or not an input node,
    /// or its staging pool is closed.
    pub fn push_input(
        &self,
        id: NodeId,
        object_id: ObjectId,
        payload: PayloadOf<C>,
    ) -> Result<(), Error> {
        if !self.is_frozen() {
            return Err(GraphError::NotFrozen.into());
        }
        let node = self.node(id).ok_or(GraphError::UnknownNode(id))?;
        if !node.is_source() {
            return Err(SchedulingError::UnexpectedInput(id).into());
        }
        node.push_input(Tagged::new(object_id, payload))
            .map_err(|_| SchedulingError::ExecutorShutDown.into())
    }
}
