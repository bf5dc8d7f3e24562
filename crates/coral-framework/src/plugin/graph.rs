//! Plugin dependency graph.
//!
//! Nodes live in an arena indexed by position, sorted by plugin name; edges
//! are index lists. Cycle detection is a depth-first colouring pass over the
//! dependency edges, run before any layering is attempted. A back edge only
//! shows the cycle on the current path, so once one is found the strongly
//! connected components are computed as well and every member of a cyclic
//! component gets a cycle through it. Layers come from Kahn's algorithm, one
//! BFS frontier per layer.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::warn;

use crate::error::CyclicDependencyError;

use super::metadata::PluginMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

struct Tarjan<'g> {
    graph: &'g DependencyGraph,
    next: usize,
    order: Vec<Option<usize>>,
    low: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    components: Vec<Vec<usize>>,
}

impl Tarjan<'_> {
    fn connect(&mut self, node: usize) {
        self.order[node] = Some(self.next);
        self.low[node] = self.next;
        self.next += 1;
        self.stack.push(node);
        self.on_stack[node] = true;

        let graph = self.graph;
        for &dep in &graph.deps[node] {
            match self.order[dep] {
                None => {
                    self.connect(dep);
                    self.low[node] = self.low[node].min(self.low[dep]);
                }
                Some(order) if self.on_stack[dep] => {
                    self.low[node] = self.low[node].min(order);
                }
                Some(_) => {}
            }
        }

        if Some(self.low[node]) == self.order[node] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack[member] = false;
                component.push(member);
                if member == node {
                    break;
                }
            }
            component.sort_unstable();
            self.components.push(component);
        }
    }
}

/// Acyclic dependency graph over an installed plugin set.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// `deps[i]`: nodes plugin `i` depends on.
    deps: Vec<Vec<usize>>,
    /// `dependents[i]`: nodes that depend on plugin `i`.
    dependents: Vec<Vec<usize>>,
    /// Declared dependencies that name no installed plugin.
    unresolved: BTreeMap<String, Vec<String>>,
    layers: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Builds the graph, failing if any dependency cycle exists.
    ///
    /// Dependencies on plugins outside `plugins` are not edges; they are
    /// logged and reported by [`unresolved`](Self::unresolved).
    pub fn build<'a>(
        plugins: impl IntoIterator<Item = &'a PluginMetadata>,
    ) -> Result<Self, CyclicDependencyError> {
        let mut declared: BTreeMap<&str, &PluginMetadata> = BTreeMap::new();
        for meta in plugins {
            if declared.insert(meta.name.as_str(), meta).is_some() {
                warn!(plugin = %meta.name, "Duplicate plugin declaration, last one wins");
            }
        }

        let names: Vec<String> = declared.keys().map(|n| n.to_string()).collect();
        let index: HashMap<String, usize> =
            names.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();

        let mut deps = vec![Vec::new(); names.len()];
        let mut dependents = vec![Vec::new(); names.len()];
        let mut unresolved: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (i, meta) in declared.values().enumerate() {
            for dep in &meta.dependencies {
                match index.get(dep) {
                    Some(&j) => {
                        if !deps[i].contains(&j) {
                            deps[i].push(j);
                            dependents[j].push(i);
                        }
                    }
                    None => {
                        warn!(
                            plugin = %meta.name,
                            dependency = %dep,
                            "Unresolved dependency, no installed plugin has this name"
                        );
                        unresolved.entry(meta.name.clone()).or_default().push(dep.clone());
                    }
                }
            }
        }
        for list in &mut dependents {
            list.sort_unstable();
        }

        let mut graph = Self {
            names,
            index,
            deps,
            dependents,
            unresolved,
            layers: Vec::new(),
        };

        let cycles = graph.find_cycles();
        if !cycles.is_empty() {
            return Err(CyclicDependencyError { cycles });
        }
        graph.layers = graph.kahn_layers();
        Ok(graph)
    }

    fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut color = vec![Color::White; self.names.len()];
        let mut path = Vec::new();
        let mut cycles = Vec::new();
        for node in 0..self.names.len() {
            if color[node] == Color::White {
                self.visit(node, &mut color, &mut path, &mut cycles);
            }
        }
        if cycles.is_empty() {
            return Vec::new();
        }

        let mut covered = vec![false; self.names.len()];
        for cycle in &cycles {
            for name in cycle {
                covered[self.index[name]] = true;
            }
        }
        for component in self.strongly_connected() {
            let cyclic = component.len() > 1 || self.deps[component[0]].contains(&component[0]);
            if !cyclic {
                continue;
            }
            let mut members = vec![false; self.names.len()];
            for &n in &component {
                members[n] = true;
            }
            for &n in &component {
                if covered[n] {
                    continue;
                }
                if let Some(path) = self.cycle_through(n, &members) {
                    for &m in &path {
                        covered[m] = true;
                    }
                    cycles.push(path.iter().map(|&m| self.names[m].clone()).collect());
                }
            }
        }
        cycles
    }

    /// Tarjan's algorithm over the dependency edges.
    fn strongly_connected(&self) -> Vec<Vec<usize>> {
        let mut tarjan = Tarjan {
            graph: self,
            next: 0,
            order: vec![None; self.names.len()],
            low: vec![0; self.names.len()],
            on_stack: vec![false; self.names.len()],
            stack: Vec::new(),
            components: Vec::new(),
        };
        for node in 0..self.names.len() {
            if tarjan.order[node].is_none() {
                tarjan.connect(node);
            }
        }
        tarjan.components
    }

    /// Shortest dependency path from `start` back to itself, staying inside
    /// `members`. The first node is repeated at the end.
    fn cycle_through(&self, start: usize, members: &[bool]) -> Option<Vec<usize>> {
        let mut parent: Vec<Option<usize>> = vec![None; self.names.len()];
        let mut seen = vec![false; self.names.len()];
        let mut queue = VecDeque::from([start]);
        seen[start] = true;

        while let Some(node) = queue.pop_front() {
            for &dep in &self.deps[node] {
                if !members[dep] {
                    continue;
                }
                if dep == start {
                    let mut path = vec![node];
                    let mut cur = node;
                    while let Some(p) = parent[cur] {
                        path.push(p);
                        cur = p;
                    }
                    path.reverse();
                    path.push(start);
                    return Some(path);
                }
                if !seen[dep] {
                    seen[dep] = true;
                    parent[dep] = Some(node);
                    queue.push_back(dep);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: usize,
        color: &mut [Color],
        path: &mut Vec<usize>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        color[node] = Color::Gray;
        path.push(node);
        for &dep in &self.deps[node] {
            match color[dep] {
                Color::White => self.visit(dep, color, path, cycles),
                Color::Gray => {
                    // Back edge: `dep` is on the current path.
                    if let Some(start) = path.iter().position(|&n| n == dep) {
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|&n| self.names[n].clone()).collect();
                        cycle.push(self.names[dep].clone());
                        cycles.push(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        path.pop();
        color[node] = Color::Black;
    }

    fn kahn_layers(&self) -> Vec<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut layers = Vec::new();
        let mut current: Vec<usize> = (0..self.names.len()).filter(|&i| in_degree[i] == 0).collect();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &i in &current {
                for &j in &self.dependents[i] {
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        next.push(j);
                    }
                }
            }
            // Arena order is name order.
            next.sort_unstable();
            layers.push(current);
            current = next;
        }
        layers
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    /// Plugin names grouped so every dependency sits in an earlier layer.
    ///
    /// Names within a layer are sorted alphabetically.
    pub fn topological_layers(&self) -> Vec<Vec<String>> {
        self.layers
            .iter()
            .map(|layer| layer.iter().map(|&i| self.names[i].clone()).collect())
            .collect()
    }

    /// Zero-based layer index of `name`.
    pub fn layer_of(&self, name: &str) -> Option<usize> {
        let node = *self.index.get(name)?;
        self.layers.iter().position(|layer| layer.contains(&node))
    }

    /// Installed plugins `name` depends on directly.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.deps[i].iter().map(|&j| self.names[j].as_str()).collect())
            .unwrap_or_default()
    }

    /// Installed plugins that depend on `name` directly.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.dependents[i].iter().map(|&j| self.names[j].as_str()).collect())
            .unwrap_or_default()
    }

    /// Declared dependencies of `name` that are not installed.
    pub fn unresolved(&self, name: &str) -> &[String] {
        self.unresolved.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
