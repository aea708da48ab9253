//! Generator dependency graph and run selection
//!
//! An edge runs from `P` to `C` when `C` reads something `P` writes: an entity
//! `P` inserts into, or an attribute `P` updates. Update loads also depend on
//! whoever inserts the entity they update. The run order is a topological
//! order with ties broken by declaration order.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::generator::Generator;

/// Dependency edges between generators, indexed by declaration order
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    upstream: Vec<BTreeSet<usize>>,
    downstream: Vec<BTreeSet<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    pub fn build(generators: &[Generator]) -> Result<Self, SchedulerError> {
        let n = generators.len();
        let mut upstream = vec![BTreeSet::new(); n];
        let mut downstream = vec![BTreeSet::new(); n];

        for (p, producer) in generators.iter().enumerate() {
            let inserts = producer.inserts();
            let updates = producer.updates();
            for (c, consumer) in generators.iter().enumerate() {
                if p == c {
                    continue;
                }
                let reads = consumer.reads();
                let depends = reads.entities.iter().any(|e| inserts.contains(e.as_str()))
                    || reads
                        .attributes
                        .iter()
                        .any(|(e, a)| updates.contains(&(e.as_str(), a.as_str())))
                    || consumer.updates().iter().any(|(e, _)| inserts.contains(e));
                if depends {
                    upstream[c].insert(p);
                    downstream[p].insert(c);
                }
            }
        }

        let names: Vec<String> = generators.iter().map(|g| g.name.clone()).collect();
        let order = topological_order(&upstream, &downstream)
            .ok_or_else(|| SchedulerError::Cycle(cycle_members(&downstream, &names)))?;
        Ok(Self {
            names,
            upstream,
            downstream,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Generator indices in run order
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Direct dependencies of `index`
    pub fn upstream(&self, index: usize) -> &BTreeSet<usize> {
        &self.upstream[index]
    }

    /// Direct dependents of `index`
    pub fn downstream(&self, index: usize) -> &BTreeSet<usize> {
        &self.downstream[index]
    }

    /// `(producer, consumer)` names of every edge
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.downstream
            .iter()
            .enumerate()
            .flat_map(|(p, cs)| cs.iter().map(move |&c| (p, c)))
            .map(|(p, c)| (self.names[p].as_str(), self.names[c].as_str()))
            .collect()
    }
}

/// Kahn's algorithm picking the lowest ready index first; `None` on a cycle
fn topological_order(upstream: &[BTreeSet<usize>], downstream: &[BTreeSet<usize>]) -> Option<Vec<usize>> {
    let mut remaining: Vec<usize> = upstream.iter().map(BTreeSet::len).collect();
    let mut ready: BTreeSet<usize> = (0..upstream.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(upstream.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &c in &downstream[next] {
            remaining[c] -= 1;
            if remaining[c] == 0 {
                ready.insert(c);
            }
        }
    }
    (order.len() == upstream.len()).then_some(order)
}

/// Names of generators on a cycle, in declaration order (Tarjan's SCCs)
fn cycle_members(downstream: &[BTreeSet<usize>], names: &[String]) -> Vec<String> {
    struct Tarjan<'a> {
        edges: &'a [BTreeSet<usize>],
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        next: usize,
        members: BTreeSet<usize>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: usize) {
            self.index[v] = Some(self.next);
            self.low[v] = self.next;
            self.next += 1;
            self.stack.push(v);
            self.on_stack[v] = true;

            for &w in self.edges[v].iter() {
                match self.index[w] {
                    None => {
                        self.visit(w);
                        self.low[v] = self.low[v].min(self.low[w]);
                    },
                    Some(iw) if self.on_stack[w] => self.low[v] = self.low[v].min(iw),
                    Some(_) => {},
                }
            }

            if Some(self.low[v]) == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                if component.len() > 1 {
                    self.members.extend(component);
                }
            }
        }
    }

    let n = downstream.len();
    let mut tarjan = Tarjan {
        edges: downstream,
        index: vec![None; n],
        low: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next: 0,
        members: BTreeSet::new(),
    };
    for v in 0..n {
        if tarjan.index[v].is_none() {
            tarjan.visit(v);
        }
    }
    tarjan.members.into_iter().map(|i| names[i].clone()).collect()
}

/// Which generators a run covers and how it executes them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    /// Restrict to these generator names or tags
    pub only: Vec<String>,
    /// Remove these generator names or tags
    pub exclude: Vec<String>,
    /// First generator of the run order to include
    pub start: Option<String>,
    /// Last generator of the run order to include
    pub until: Option<String>,
    /// Run generators even when the completion log marks them complete
    pub retry: bool,
    /// Run one generator at a time
    pub serial: bool,
    /// Overrides the configured batch size
    pub batch_size: Option<usize>,
    pub skip_row_count: bool,
    /// Keep launching independent generators after a failure
    pub keep_going: bool,
}

impl RunFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only(mut self, name: impl Into<String>) -> Self {
        self.only.push(name.into());
        self
    }

    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.exclude.push(name.into());
        self
    }

    pub fn start(mut self, name: impl Into<String>) -> Self {
        self.start = Some(name.into());
        self
    }

    pub fn until(mut self, name: impl Into<String>) -> Self {
        self.until = Some(name.into());
        self
    }

    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn serial(mut self, serial: bool) -> Self {
        self.serial = serial;
        self
    }

    pub fn skip_row_count(mut self, skip: bool) -> Self {
        self.skip_row_count = skip;
        self
    }

    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Selected generator indices, in run order.
    ///
    /// `start`/`until` cut a contiguous range of the run order, then `only`
    /// intersects and `exclude` subtracts. Every name must match a generator
    /// (or, for `only`/`exclude`, a tag).
    pub fn select(&self, graph: &DependencyGraph, generators: &[Generator]) -> Result<Vec<usize>, SchedulerError> {
        let position = |name: &str| -> Result<usize, SchedulerError> {
            graph
                .index_of(name)
                .and_then(|i| graph.order().iter().position(|&o| o == i))
                .ok_or_else(|| SchedulerError::UnknownGenerator(name.to_string()))
        };
        let from = self.start.as_deref().map(position).transpose()?.unwrap_or(0);
        let to = match self.until.as_deref() {
            Some(name) => position(name)?,
            None => graph.order().len().saturating_sub(1),
        };
        if let (Some(start), Some(until)) = (&self.start, &self.until) {
            if from > to {
                return Err(SchedulerError::EmptyRange {
                    start: start.clone(),
                    until: until.clone(),
                });
            }
        }

        let matches = |pattern: &str, g: &Generator| g.name == pattern || g.has_tag(pattern);
        for pattern in self.only.iter().chain(&self.exclude) {
            if !generators.iter().any(|g| matches(pattern, g)) {
                return Err(SchedulerError::UnknownGenerator(pattern.clone()));
            }
        }

        let range = graph.order().get(from..=to).unwrap_or(&[]);
        Ok(range
            .iter()
            .copied()
            .filter(|&i| self.only.is_empty() || self.only.iter().any(|p| matches(p, &generators[i])))
            .filter(|&i| !self.exclude.iter().any(|p| matches(p, &generators[i])))
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::expr::col;
    use crate::generator::Load;
    use crate::nodes::Arg;
    use crate::query::{Query, RawQuery};
    use crate::schema::Path;

    fn loads_x() -> Generator {
        Generator::new("a").load(Load::insert("x").value("v", Arg::value(1)))
    }

    fn reads_x(name: &str) -> Generator {
        Generator::new(name)
            .query(Query::new(["x"]).select("v", col(&Path::root("x"), "v")))
            .load(Load::insert("y").value("v", Arg::query("v")))
    }

    #[test]
    fn test_writer_runs_before_reader_regardless_of_declaration() {
        let gens = vec![reads_x("b"), loads_x()];
        let graph = DependencyGraph::build(&gens).unwrap();
        assert_eq!(graph.order(), &[1, 0]);
        assert_eq!(graph.edges(), vec![("a", "b")]);
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let gens = vec![
            Generator::new("p").load(Load::insert("p").value("v", Arg::value(1))),
            Generator::new("q").load(Load::insert("q").value("v", Arg::value(1))),
            Generator::new("r").load(Load::insert("r").value("v", Arg::value(1))),
        ];
        let graph = DependencyGraph::build(&gens).unwrap();
        assert_eq!(graph.order(), &[0, 1, 2]);
    }

    #[test]
    fn test_update_of_read_attribute_creates_edge() {
        let updater = Generator::new("fix")
            .raw(RawQuery::new("SELECT 1 AS k, 2 AS v", ["k", "v"]))
            .load(Load::update("z").value("v", Arg::query("v")).key(Arg::query("k")));
        let reader = Generator::new("use")
            .query(Query::new(["z"]).select("v", col(&Path::root("z"), "v")))
            .load(Load::insert("w").value("v", Arg::query("v")));
        let graph = DependencyGraph::build(&[reader, updater]).unwrap();
        assert_eq!(graph.order(), &[1, 0]);
    }

    #[test]
    fn test_mutual_dependency_names_both() {
        let a = Generator::new("a")
            .query(Query::new(["y"]).select("v", col(&Path::root("y"), "v")))
            .load(Load::insert("x").value("v", Arg::query("v")));
        let b = Generator::new("b")
            .query(Query::new(["x"]).select("v", col(&Path::root("x"), "v")))
            .load(Load::insert("y").value("v", Arg::query("v")));
        let c = Generator::new("c").load(Load::insert("z").value("v", Arg::value(1)));
        let err = DependencyGraph::build(&[c, b, a]).unwrap_err();
        assert_eq!(err, SchedulerError::Cycle(vec!["b".into(), "a".into()]));
    }

    #[test]
    fn test_self_read_is_not_a_cycle() {
        let g = Generator::new("grow")
            .query(Query::new(["x"]).select("v", col(&Path::root("x"), "v")))
            .load(Load::insert("x").value("v", Arg::query("v")));
        assert!(DependencyGraph::build(&[g]).is_ok());
    }

    fn chain() -> (Vec<Generator>, DependencyGraph) {
        let gens = vec![loads_x().tag("seed"), reads_x("b"), reads_x("c").tag("report")];
        let graph = DependencyGraph::build(&gens).unwrap();
        (gens, graph)
    }

    #[test]
    fn test_filter_range_and_sets() {
        let (gens, graph) = chain();
        let names = |idx: Vec<usize>| idx.into_iter().map(|i| gens[i].name.clone()).collect::<Vec<_>>();

        assert_eq!(names(RunFilter::new().select(&graph, &gens).unwrap()), ["a", "b", "c"]);
        assert_eq!(names(RunFilter::new().start("b").select(&graph, &gens).unwrap()), ["b", "c"]);
        assert_eq!(names(RunFilter::new().until("b").select(&graph, &gens).unwrap()), ["a", "b"]);
        assert_eq!(names(RunFilter::new().only("report").select(&graph, &gens).unwrap()), ["c"]);
        assert_eq!(
            names(RunFilter::new().exclude("seed").select(&graph, &gens).unwrap()),
            ["b", "c"]
        );
        assert_eq!(
            names(RunFilter::new().start("a").only("b").only("c").exclude("c").select(&graph, &gens).unwrap()),
            ["b"]
        );
    }

    #[test]
    fn test_filter_errors() {
        let (gens, graph) = chain();
        assert_eq!(
            RunFilter::new().only("nope").select(&graph, &gens).unwrap_err(),
            SchedulerError::UnknownGenerator("nope".into())
        );
        assert!(matches!(
            RunFilter::new().start("c").until("a").select(&graph, &gens),
            Err(SchedulerError::EmptyRange { .. })
        ));
    }
}
