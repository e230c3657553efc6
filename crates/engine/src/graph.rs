//! Graph definition and build-time validation.
//!
//! Rules enforced by [`GraphBuilder::build`]:
//! 1. An entry node is set and registered.
//! 2. Node IDs are unique.
//! 3. Every node has exactly one outgoing edge (fixed or conditional).
//! 4. Every edge endpoint, including declared conditional targets, is a
//!    registered node or `End`.
//!
//! Cycles are allowed: polling loops are cycles.  Nodes unreachable from the
//! entry only produce a warning.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use nodes::{NodeHandler, State};
use tracing::warn;

use crate::EngineError;

/// Identifier of a graph node, normally a fieldless enum owned by the
/// application.
pub trait NodeId: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Stable name used in logs and in recorded errors.
    fn name(&self) -> &'static str;
}

/// Where a traversal goes after a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Next<N> {
    Node(N),
    End,
}

/// A pure routing function over the State.
pub type Router<N> = Arc<dyn Fn(&State) -> Next<N> + Send + Sync>;

/// Outgoing edge of one node.
#[derive(Clone)]
pub enum Route<N> {
    Fixed(Next<N>),
    Conditional(Router<N>),
}

impl<N: NodeId> Route<N> {
    pub fn resolve(&self, state: &State) -> Next<N> {
        match self {
            Self::Fixed(next) => *next,
            Self::Conditional(router) => router(state),
        }
    }
}

impl<N: Debug> Debug for Route<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(next) => f.debug_tuple("Fixed").field(next).finish(),
            Self::Conditional(_) => f.write_str("Conditional(..)"),
        }
    }
}

struct EdgeSpec<N> {
    from: N,
    route: Route<N>,
    /// Targets the edge can produce.  Fixed edges have exactly one.
    targets: Vec<Next<N>>,
}

/// Collects nodes and edges, then validates them into an immutable [`Graph`].
pub struct GraphBuilder<N: NodeId> {
    entry: Option<N>,
    nodes: Vec<(N, Arc<dyn NodeHandler>)>,
    edges: Vec<EdgeSpec<N>>,
}

impl<N: NodeId> Default for GraphBuilder<N> {
    fn default() -> Self {
        Self { entry: None, nodes: Vec::new(), edges: Vec::new() }
    }
}

impl<N: NodeId> GraphBuilder<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(self, id: N, handler: impl NodeHandler + 'static) -> Self {
        self.add_node_arc(id, Arc::new(handler))
    }

    pub fn add_node_arc(mut self, id: N, handler: Arc<dyn NodeHandler>) -> Self {
        self.nodes.push((id, handler));
        self
    }

    pub fn add_edge(mut self, from: N, to: Next<N>) -> Self {
        self.edges.push(EdgeSpec { from, route: Route::Fixed(to), targets: vec![to] });
        self
    }

    /// Attach a routing function to `from`.  `targets` lists every node the
    /// router may return; it drives build-time validation and the
    /// reachability check.  A router that returns an unregistered node at
    /// traversal time records a routing error instead of panicking.
    pub fn add_conditional_edge<F>(mut self, from: N, targets: &[Next<N>], router: F) -> Self
    where
        F: Fn(&State) -> Next<N> + Send + Sync + 'static,
    {
        self.edges.push(EdgeSpec {
            from,
            route: Route::Conditional(Arc::new(router)),
            targets: targets.to_vec(),
        });
        self
    }

    pub fn set_entry(mut self, id: N) -> Self {
        self.entry = Some(id);
        self
    }

    pub fn build(self) -> Result<Graph<N>, EngineError> {
        let entry = self.entry.ok_or(EngineError::MissingEntry)?;

        let mut nodes: HashMap<N, Arc<dyn NodeHandler>> = HashMap::with_capacity(self.nodes.len());
        for (id, handler) in self.nodes {
            if nodes.insert(id, handler).is_some() {
                return Err(EngineError::DuplicateNodeId(id.name().to_owned()));
            }
        }
        if !nodes.contains_key(&entry) {
            return Err(EngineError::UnknownEntry(entry.name().to_owned()));
        }

        let mut routes: HashMap<N, Route<N>> = HashMap::with_capacity(self.edges.len());
        let mut adjacency: HashMap<N, Vec<N>> = HashMap::new();
        for edge in self.edges {
            if !nodes.contains_key(&edge.from) {
                return Err(EngineError::UnknownNodeReference {
                    node_id: edge.from.name().to_owned(),
                    side: "from",
                });
            }
            for target in &edge.targets {
                if let Next::Node(to) = target {
                    if !nodes.contains_key(to) {
                        return Err(EngineError::UnknownNodeReference {
                            node_id: to.name().to_owned(),
                            side: "to",
                        });
                    }
                    adjacency.entry(edge.from).or_default().push(*to);
                }
            }
            if routes.insert(edge.from, edge.route).is_some() {
                return Err(EngineError::DuplicateEdge(edge.from.name().to_owned()));
            }
        }

        if let Some(id) = nodes.keys().find(|id| !routes.contains_key(*id)) {
            return Err(EngineError::MissingEdge(id.name().to_owned()));
        }

        // Breadth-first walk from the entry over declared targets.
        let mut seen: HashSet<N> = HashSet::from([entry]);
        let mut queue: VecDeque<N> = VecDeque::from([entry]);
        while let Some(id) = queue.pop_front() {
            for next in adjacency.get(&id).into_iter().flatten() {
                if seen.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }
        for id in nodes.keys().filter(|id| !seen.contains(*id)) {
            warn!(node = id.name(), "node is unreachable from the entry");
        }

        Ok(Graph { entry, nodes, routes })
    }
}

/// Immutable, validated graph.  Shared across concurrent traversals.
pub struct Graph<N: NodeId> {
    entry: N,
    nodes: HashMap<N, Arc<dyn NodeHandler>>,
    routes: HashMap<N, Route<N>>,
}

impl<N: NodeId> Debug for Graph<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("entry", &self.entry)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("routes", &self.routes)
            .finish()
    }
}

impl<N: NodeId> Graph<N> {
    pub fn builder() -> GraphBuilder<N> {
        GraphBuilder::new()
    }

    pub fn entry(&self) -> N {
        self.entry
    }

    pub fn handler(&self, id: N) -> Option<&Arc<dyn NodeHandler>> {
        self.nodes.get(&id)
    }

    pub fn route(&self, id: N) -> Option<&Route<N>> {
        self.routes.get(&id)
    }

    pub fn contains(&self, id: N) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
