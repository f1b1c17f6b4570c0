//! Dependency DAG over dense integer indices with adjacency lists.
//!
//! Topological order uses Kahn's algorithm with alphabetical tie-breaking for
//! determinism. Cycle detection reports the member nodes.

use std::collections::HashMap;

/// A directed graph of node ids; edges run dependency → dependent.
#[derive(Debug, Clone)]
pub struct Dag {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    /// adjacency\[i\] = indices of nodes depending on i
    adjacency: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
}

impl Dag {
    pub fn new(ids: impl IntoIterator<Item = String>) -> Self {
        let ids: Vec<String> = ids.into_iter().collect();
        let index = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        let n = ids.len();
        Self {
            ids,
            index,
            adjacency: vec![Vec::new(); n],
            in_degree: vec![0; n],
        }
    }

    /// Add an edge: `dependent` must apply after `dependency`.
    /// Unknown ids are a caller bug; the loader validates them beforehand.
    pub fn add_edge(&mut self, dependency: &str, dependent: &str) -> Result<(), String> {
        let from = *self
            .index
            .get(dependency)
            .ok_or_else(|| format!("unknown node '{}'", dependency))?;
        let to = *self
            .index
            .get(dependent)
            .ok_or_else(|| format!("unknown node '{}'", dependent))?;
        if !self.adjacency[from].contains(&to) {
            self.adjacency[from].push(to);
            self.in_degree[to] += 1;
        }
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Kahn's algorithm. On a cycle, returns the ids of the nodes left
    /// unordered (the cycle members and everything downstream of them).
    pub fn toposort(&self) -> Result<Vec<String>, Vec<String>> {
        let mut in_degree = self.in_degree.clone();

        let mut ready: Vec<usize> = (0..self.ids.len()).filter(|&i| in_degree[i] == 0).collect();
        ready.sort_by(|&a, &b| self.ids[a].cmp(&self.ids[b]));

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(current) = ready.first().copied() {
            ready.remove(0);
            order.push(current);

            let mut next: Vec<usize> = Vec::new();
            for &dependent in &self.adjacency[current] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
            for idx in next {
                let pos = ready
                    .binary_search_by(|&i| self.ids[i].cmp(&self.ids[idx]))
                    .unwrap_or_else(|p| p);
                ready.insert(pos, idx);
            }
        }

        if order.len() != self.ids.len() {
            let mut members: Vec<String> = (0..self.ids.len())
                .filter(|i| !order.contains(i))
                .map(|i| self.ids[i].clone())
                .collect();
            members.sort();
            return Err(members);
        }

        Ok(order.into_iter().map(|i| self.ids[i].clone()).collect())
    }

    /// All nodes transitively depending on `id`, sorted.
    pub fn dependents_transitive(&self, id: &str) -> Vec<String> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.ids.len()];
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            for &dep in &self.adjacency[i] {
                if !seen[dep] {
                    seen[dep] = true;
                    stack.push(dep);
                }
            }
        }
        let mut out: Vec<String> = seen
            .iter()
            .enumerate()
            .filter(|(_, &s)| s)
            .map(|(i, _)| self.ids[i].clone())
            .collect();
        out.sort();
        out
    }

    /// Direct dependents of `id`, sorted.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        let Some(&i) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self.adjacency[i]
            .iter()
            .map(|&d| self.ids[d].clone())
            .collect();
        out.sort();
        out
    }
}
