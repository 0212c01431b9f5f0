//! The runnable dependency graph.
//!
//! Nodes are runnables; directed edges point from upstream (producer) to
//! downstream (consumer) and carry the `{strict, isolated}` flags inherited
//! from the declaring dependency. Construction rejects cycles, reporting one
//! representative cycle as a path. Topological order is stable: ties break
//! by runnable slug.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use color_eyre::{Result, eyre::eyre};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::{Direction, visit::EdgeRef};
use tracing::instrument;

use crate::{
    error::Error,
    runnable::{Runnable, RunnableSet, Slug},
};

/// The flags carried on a dependency edge.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct EdgeMeta {
    /// Selection of the upstream pulls the downstream in.
    pub strict: bool,
    /// Soft ordering edge: droppable under `--isolated`, failure does not
    /// poison the downstream.
    pub isolated: bool,
}

/// The built DAG over a runnable set.
#[derive(Debug)]
pub struct RunGraph {
    runnables: RunnableSet,
    graph: DiGraph<Slug, EdgeMeta>,
    indices: BTreeMap<Slug, NodeIndex>,
}

impl RunGraph {
    /// Link the runnables into a graph, failing on any cycle.
    #[instrument(skip(runnables), fields(count = runnables.len()))]
    pub fn build(runnables: RunnableSet) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = BTreeMap::new();

        for slug in runnables.slugs() {
            let index = graph.add_node(slug.clone());
            indices.insert(slug.clone(), index);
        }

        // Parallel declarations of the same edge merge: the edge is strict
        // if any declaration is, and soft only if every declaration is.
        let mut edges: BTreeMap<(Slug, Slug), EdgeMeta> = BTreeMap::new();
        for runnable in runnables.iter() {
            for dep in &runnable.deps {
                for edge in dep.edges() {
                    if !indices.contains_key(&edge.upstream) {
                        return Err(eyre!(
                            "{} depends on unexpanded runnable {}",
                            runnable.slug,
                            edge.upstream
                        ));
                    }
                    edges
                        .entry((edge.upstream.clone(), runnable.slug.clone()))
                        .and_modify(|meta| {
                            meta.strict |= edge.strict;
                            meta.isolated &= edge.isolated;
                        })
                        .or_insert(EdgeMeta {
                            strict: edge.strict,
                            isolated: edge.isolated,
                        });
                }
            }
        }
        for ((upstream, downstream), meta) in edges {
            graph.add_edge(indices[&upstream], indices[&downstream], meta);
        }

        let built = Self {
            runnables,
            graph,
            indices,
        };
        if let Some(path) = built.find_cycle() {
            return Err(Error::CycleDetected {
                path: path.iter().map(|slug| slug.to_string()).collect(),
            }
            .into());
        }
        Ok(built)
    }

    pub fn runnables(&self) -> &RunnableSet {
        &self.runnables
    }

    pub fn runnable(&self, slug: &Slug) -> Result<&Arc<Runnable>> {
        self.runnables
            .get(slug)
            .ok_or_else(|| eyre!("unknown runnable: {slug}"))
    }

    /// Direct upstreams of a runnable with their edge flags.
    pub fn upstreams(&self, slug: &Slug) -> Vec<(&Slug, EdgeMeta)> {
        let Some(&index) = self.indices.get(slug) else {
            return vec![];
        };
        self.graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| (&self.graph[edge.source()], *edge.weight()))
            .collect()
    }

    /// Direct downstreams of a runnable with their edge flags.
    pub fn downstreams(&self, slug: &Slug) -> Vec<(&Slug, EdgeMeta)> {
        let Some(&index) = self.indices.get(slug) else {
            return vec![];
        };
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| (&self.graph[edge.target()], *edge.weight()))
            .collect()
    }

    /// The stable topological order: Kahn's algorithm with the ready set
    /// ordered by slug.
    pub fn topo(&self) -> Vec<Slug> {
        let mut in_degree: BTreeMap<Slug, usize> = self
            .runnables
            .slugs()
            .map(|slug| (slug.clone(), self.upstreams(slug).len()))
            .collect();

        let mut ready: BTreeSet<Slug> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(slug, _)| slug.clone())
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(slug) = ready.pop_first() {
            for (downstream, _) in self.downstreams(&slug) {
                let degree = in_degree.get_mut(downstream).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(downstream.clone());
                }
            }
            order.push(slug);
        }
        order
    }

    /// The transitive upstream closure of the given slugs, walking only
    /// edges `follow` accepts. The starting slugs are included.
    pub fn upstream_closure(
        &self,
        from: impl IntoIterator<Item = Slug>,
        follow: impl Fn(EdgeMeta) -> bool,
    ) -> BTreeSet<Slug> {
        self.closure(from, Direction::Incoming, follow)
    }

    /// The transitive downstream closure along strict edges. The starting
    /// slugs are included.
    pub fn strict_downstream_closure(
        &self,
        from: impl IntoIterator<Item = Slug>,
    ) -> BTreeSet<Slug> {
        self.closure(from, Direction::Outgoing, |meta| meta.strict)
    }

    fn closure(
        &self,
        from: impl IntoIterator<Item = Slug>,
        direction: Direction,
        follow: impl Fn(EdgeMeta) -> bool,
    ) -> BTreeSet<Slug> {
        let mut seen: BTreeSet<Slug> = from.into_iter().collect();
        let mut queue: VecDeque<Slug> = seen.iter().cloned().collect();

        while let Some(slug) = queue.pop_front() {
            let Some(&index) = self.indices.get(&slug) else {
                continue;
            };
            for edge in self.graph.edges_directed(index, direction) {
                if !follow(*edge.weight()) {
                    continue;
                }
                let next = match direction {
                    Direction::Incoming => &self.graph[edge.source()],
                    Direction::Outgoing => &self.graph[edge.target()],
                };
                if seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        seen
    }

    /// Three-color iterative DFS; returns one representative cycle as a
    /// path, first node repeated at the end.
    fn find_cycle(&self) -> Option<Vec<Slug>> {
        #[derive(Copy, Clone, Eq, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: BTreeMap<NodeIndex, Color> = self
            .indices
            .values()
            .map(|&index| (index, Color::White))
            .collect();

        // Iterate roots in slug order so the reported cycle is
        // deterministic.
        for &root in self.indices.values() {
            if color[&root] != Color::White {
                continue;
            }

            let mut stack = vec![(root, self.graph.neighbors(root).collect::<Vec<_>>())];
            color.insert(root, Color::Gray);

            while let Some((node, pending)) = stack.last_mut() {
                let node = *node;
                match pending.pop() {
                    Some(next) => match color[&next] {
                        Color::White => {
                            color.insert(next, Color::Gray);
                            let neighbors = self.graph.neighbors(next).collect();
                            stack.push((next, neighbors));
                        }
                        Color::Gray => {
                            // The gray node is on the stack: the path from
                            // it to the top is the cycle.
                            let mut path: Vec<Slug> = stack
                                .iter()
                                .map(|(index, _)| self.graph[*index].clone())
                                .skip_while(|slug| slug != &self.graph[next])
                                .collect();
                            path.push(self.graph[next].clone());
                            return Some(path);
                        }
                        Color::Black => {}
                    },
                    None => {
                        color.insert(node, Color::Black);
                        stack.pop();
                    }
                }
            }
        }
        None
    }
}
