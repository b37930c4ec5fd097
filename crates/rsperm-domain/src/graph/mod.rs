//! Permission dependency graph.
//!
//! An edge `from -> to` means holding `from` also grants `to`. Nodes are
//! unscoped `action:resource` keys stored in an arena and addressed by index;
//! adjacency lists are kept sorted by key so traversal order depends only on
//! the graph contents, never on insertion order.
//!
//! Acyclicity is checked once, at load time, with a topological sort.
//! [`DependencyGraph::expand`] still caps its traversal depth so that a graph
//! that skipped validation cannot loop.

use std::collections::{HashMap, VecDeque};

use tracing::warn;

use crate::error::{DomainError, DomainResult};
use crate::model::Permission;

/// Default traversal depth cap for [`DependencyGraph::expand`].
pub const DEFAULT_MAX_EXPAND_DEPTH: u32 = 16;

type NodeId = usize;

/// Arena-backed DAG of permission implications.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, NodeId>,
    /// `implies[a]` holds every `b` with edge `a -> b`.
    implies: Vec<Vec<NodeId>>,
    /// `implied_by[b]` holds every `a` with edge `a -> b`.
    implied_by: Vec<Vec<NodeId>>,
    max_depth: u32,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            implies: Vec::new(),
            implied_by: Vec::new(),
            max_depth: DEFAULT_MAX_EXPAND_DEPTH,
        }
    }

    /// Builds a graph from `(from, to)` pairs and validates it.
    ///
    /// Fails with [`DomainError::DependencyCycle`] if the edges contain a cycle.
    pub fn from_edges<I, A, B>(edges: I) -> DomainResult<Self>
    where
        I: IntoIterator<Item = (A, B)>,
        A: AsRef<str>,
        B: AsRef<str>,
    {
        let mut graph = Self::new();
        for (from, to) in edges {
            graph.add_edge(from.as_ref(), to.as_ref())?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Sets the traversal depth cap.
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Returns the traversal depth cap.
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Number of permission nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.implies.iter().map(Vec::len).sum()
    }

    /// Whether the key is a node of this graph.
    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Adds the edge `from -> to` (holding `from` grants `to`).
    ///
    /// Both keys must be unscoped `action:resource` identifiers. Duplicate
    /// edges are ignored. Cycles are not rejected here; call
    /// [`validate`](Self::validate) once loading is done.
    pub fn add_edge(&mut self, from: &str, to: &str) -> DomainResult<()> {
        let from = self.intern(from)?;
        let to = self.intern(to)?;
        insert_sorted(&mut self.implies[from], to, &self.nodes);
        insert_sorted(&mut self.implied_by[to], from, &self.nodes);
        Ok(())
    }

    /// Removes the edge `from -> to`. Returns whether it existed.
    pub fn remove_edge(&mut self, from: &str, to: &str) -> bool {
        let (Some(&from), Some(&to)) = (self.index.get(from), self.index.get(to)) else {
            return false;
        };
        let existed = self.implies[from].contains(&to);
        self.implies[from].retain(|&n| n != to);
        self.implied_by[to].retain(|&n| n != from);
        existed
    }

    /// Checks that the graph is acyclic.
    pub fn validate(&self) -> DomainResult<()> {
        self.topological_order().map(|_| ())
    }

    /// Returns every node in a topological order (implying before implied).
    ///
    /// Uses Kahn's algorithm; ties are broken by key so the order is stable.
    pub fn topological_order(&self) -> DomainResult<Vec<String>> {
        let mut in_degree: Vec<usize> = self.implied_by.iter().map(Vec::len).collect();
        let mut ready: Vec<NodeId> = (0..self.nodes.len())
            .filter(|&n| in_degree[n] == 0)
            .collect();
        ready.sort_by(|a, b| self.nodes[*b].cmp(&self.nodes[*a]));

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop() {
            order.push(node);
            for &next in &self.implies[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(next);
                    ready.sort_by(|a, b| self.nodes[*b].cmp(&self.nodes[*a]));
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order.into_iter().map(|n| self.nodes[n].clone()).collect());
        }

        let remaining: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
        Err(DomainError::DependencyCycle {
            path: self.describe_cycle(&remaining),
        })
    }

    /// Returns the permissions whose possession satisfies `key`, most specific
    /// first: `key` itself, then its direct implicators, then theirs, breadth
    /// first. The result is duplicate-free and deterministic for a given graph.
    ///
    /// Unknown keys expand to themselves.
    pub fn expand(&self, key: &str) -> Vec<String> {
        let Some(&start) = self.index.get(key) else {
            return vec![key.to_string()];
        };

        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut queue = VecDeque::from([(start, 0u32)]);
        visited[start] = true;

        while let Some((node, depth)) = queue.pop_front() {
            order.push(self.nodes[node].clone());
            if self.implied_by[node].is_empty() {
                continue;
            }
            if depth >= self.max_depth {
                warn!(
                    key = key,
                    max_depth = self.max_depth,
                    "dependency expansion hit depth cap"
                );
                continue;
            }
            for &parent in &self.implied_by[node] {
                if !visited[parent] {
                    visited[parent] = true;
                    queue.push_back((parent, depth + 1));
                }
            }
        }
        order
    }

    /// Returns every `(from, to)` edge, sorted.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges: Vec<(String, String)> = self
            .implies
            .iter()
            .enumerate()
            .flat_map(|(from, targets)| {
                targets
                    .iter()
                    .map(move |&to| (self.nodes[from].clone(), self.nodes[to].clone()))
            })
            .collect();
        edges.sort();
        edges
    }

    fn intern(&mut self, key: &str) -> DomainResult<NodeId> {
        if let Some(&id) = self.index.get(key) {
            return Ok(id);
        }
        let permission = Permission::parse(key)?;
        if permission.resource_id.is_some() {
            return Err(DomainError::InvalidPermissionFormat {
                value: key.to_string(),
            });
        }
        let id = self.nodes.len();
        self.nodes.push(key.to_string());
        self.index.insert(key.to_string(), id);
        self.implies.push(Vec::new());
        self.implied_by.push(Vec::new());
        Ok(id)
    }

    /// Walks backwards through nodes Kahn's algorithm could not release until a
    /// node repeats, and renders that cycle in edge direction.
    fn describe_cycle(&self, remaining: &[bool]) -> String {
        let Some(start) = (0..self.nodes.len())
            .filter(|&n| remaining[n])
            .min_by(|a, b| self.nodes[*a].cmp(&self.nodes[*b]))
        else {
            return String::new();
        };

        let mut seen_at: HashMap<NodeId, usize> = HashMap::new();
        let mut walk = vec![start];
        let mut current = start;
        loop {
            seen_at.insert(current, walk.len() - 1);
            // Every remaining node keeps at least one remaining predecessor.
            let Some(&prev) = self.implied_by[current].iter().find(|&&p| remaining[p]) else {
                break;
            };
            if let Some(&pos) = seen_at.get(&prev) {
                let mut cycle: Vec<&str> = walk[pos..]
                    .iter()
                    .rev()
                    .map(|&n| self.nodes[n].as_str())
                    .collect();
                cycle.insert(0, self.nodes[walk[pos]].as_str());
                return cycle.join(" -> ");
            }
            walk.push(prev);
            current = prev;
        }
        self.nodes[start].clone()
    }
}

fn insert_sorted(list: &mut Vec<NodeId>, id: NodeId, nodes: &[String]) {
    if let Err(pos) = list.binary_search_by(|&n| nodes[n].cmp(&nodes[id])) {
        list.insert(pos, id);
    }
}
