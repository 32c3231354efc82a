//! Ordered pipeline of graph mutation passes.

use std::fmt;

use crate::error::{GraphError, GraphResult};
use crate::graph::graph::Graph;

/// A graph rewrite.
///
/// `mutate` returns the number of changes made. Every pass documents its
/// idempotence contract; all passes shipped with the crate report zero
/// changes when run a second time on their own output.
pub trait GraphMutator {
    fn name(&self) -> &str;

    fn mutate(&self, graph: &mut Graph) -> GraphResult<usize>;
}

/// Changes made by each pass of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub changes: Vec<(String, usize)>,
}

impl PassStats {
    pub fn total(&self) -> usize {
        self.changes.iter().map(|(_, n)| n).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl fmt::Display for PassStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "PassStats: no changes");
        }
        write!(f, "PassStats:")?;
        for (name, n) in &self.changes {
            write!(f, " {} {},", n, name)?;
        }
        write!(f, " ({} total)", self.total())
    }
}

#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn GraphMutator>>,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, pass: Box<dyn GraphMutator>) {
        tracing::debug!("Appending pass {}", pass.name());
        self.passes.push(pass);
    }

    pub fn num_passes(&self) -> usize {
        self.passes.len()
    }

    pub fn pass(&self, index: usize) -> Option<&dyn GraphMutator> {
        self.passes.get(index).map(|p| p.as_ref())
    }

    pub fn clear(&mut self) {
        self.passes.clear();
    }

    /// Apply every pass in order.
    pub fn run_all(&self, graph: &mut Graph) -> GraphResult<PassStats> {
        let mut stats = PassStats::default();
        for pass in &self.passes {
            let n = Self::apply(pass.as_ref(), graph)?;
            stats.changes.push((pass.name().to_string(), n));
        }
        tracing::debug!("Graph '{}': {}", graph.name(), stats);
        Ok(stats)
    }

    /// Apply the pass at `index` only.
    pub fn run(&self, graph: &mut Graph, index: usize) -> GraphResult<usize> {
        let pass = self.pass(index).ok_or_else(|| {
            GraphError::InvalidConfiguration(format!(
                "pass index {} out of range, {} passes registered",
                index,
                self.passes.len()
            ))
        })?;
        Self::apply(pass, graph)
    }

    fn apply(pass: &dyn GraphMutator, graph: &mut Graph) -> GraphResult<usize> {
        let n = pass.mutate(graph)?;
        tracing::debug!("Pass {} on graph '{}': {} changes", pass.name(), graph.name(), n);
        Ok(n)
    }
}

impl fmt::Debug for PassManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.passes.iter().map(|p| p.name().to_string()))
            .finish()
    }
}
