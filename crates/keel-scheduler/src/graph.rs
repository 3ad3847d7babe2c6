//! Dependency graph over resource nodes.

use keel_core::{Error, ResourceNode, Result};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// A validated, acyclic set of nodes in execution order.
#[derive(Debug, Clone)]
pub struct Graph {
    /// Topological order, dependencies first.
    nodes: Vec<ResourceNode>,
    index: HashMap<String, usize>,
    dependencies: Vec<BTreeSet<String>>,
    dependents: Vec<Vec<String>>,
}

impl Graph {
    /// Validate `nodes` and order them.
    ///
    /// Fails with `InvalidInput` on duplicate ids or edges to unknown nodes
    /// and with `CycleDetected` (carrying the full cycle) if the dependency
    /// relation is not acyclic. Nodes with no ordering constraint between
    /// them keep their declaration order.
    pub fn build(nodes: Vec<ResourceNode>) -> Result<Self> {
        let mut decl: HashMap<&str, usize> = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if decl.insert(node.id.as_str(), i).is_some() {
                return Err(Error::InvalidInput(format!("duplicate node id '{}'", node.id)));
            }
        }

        // Dependencies by declaration index, in declaration order.
        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let mut edges = Vec::new();
            for dep in node.depends_on() {
                let Some(&j) = decl.get(dep.as_str()) else {
                    return Err(Error::InvalidInput(format!(
                        "node '{}' depends on unknown node '{dep}'",
                        node.id
                    )));
                };
                edges.push(j);
            }
            edges.sort_unstable();
            deps.push(edges);
        }

        detect_cycle(&nodes, &deps)?;
        let order = topological_order(&deps);

        let mut position = vec![0; nodes.len()];
        for (pos, &i) in order.iter().enumerate() {
            position[i] = pos;
        }

        let mut dependents: Vec<Vec<String>> = vec![Vec::new(); nodes.len()];
        for &i in &order {
            for &j in &deps[i] {
                dependents[position[j]].push(nodes[i].id.clone());
            }
        }

        let mut slots: Vec<Option<ResourceNode>> = nodes.into_iter().map(Some).collect();
        let mut ordered = Vec::with_capacity(slots.len());
        for &i in &order {
            if let Some(node) = slots[i].take() {
                ordered.push(node);
            }
        }

        let index = ordered
            .iter()
            .enumerate()
            .map(|(pos, n)| (n.id.clone(), pos))
            .collect();
        let dependencies = ordered.iter().map(ResourceNode::depends_on).collect();

        Ok(Self {
            nodes: ordered,
            index,
            dependencies,
            dependents,
        })
    }

    /// Nodes in execution order.
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Position of `id` in execution order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn dependencies(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.index.get(id).map(|&i| &self.dependencies[i])
    }

    /// Nodes that directly depend on `id`, in execution order.
    pub fn dependents(&self, id: &str) -> &[String] {
        self.index
            .get(id)
            .map(|&i| self.dependents[i].as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn detect_cycle(nodes: &[ResourceNode], deps: &[Vec<usize>]) -> Result<()> {
    fn visit(
        i: usize,
        deps: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[i] = Mark::OnStack;
        stack.push(i);
        for &j in &deps[i] {
            match marks[j] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&k| k == j).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(j);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(j, deps, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[i] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut stack = Vec::new();
    for i in 0..nodes.len() {
        if marks[i] != Mark::Unvisited {
            continue;
        }
        if let Some(cycle) = visit(i, deps, &mut marks, &mut stack) {
            // The walk follows dependency edges; report the cycle in
            // dependency-to-dependent direction.
            let path = cycle.iter().rev().map(|&k| nodes[k].id.clone()).collect();
            return Err(Error::CycleDetected { path });
        }
    }
    Ok(())
}

/// Kahn's algorithm, always taking the earliest-declared ready node.
fn topological_order(deps: &[Vec<usize>]) -> Vec<usize> {
    let mut remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); deps.len()];
    for (i, edges) in deps.iter().enumerate() {
        for &j in edges {
            dependents[j].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..deps.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(deps.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                ready.insert(d);
            }
        }
    }
    order
}

/// A random acyclic stack of `n` nodes in shuffled declaration order. Edges
/// are a mix of output references and explicit dependencies.
#[cfg(test)]
pub(crate) fn random_dag(rng: &mut impl rand::Rng, n: usize) -> Vec<ResourceNode> {
    use keel_core::Value;
    use rand::seq::SliceRandom;

    let mut nodes: Vec<ResourceNode> = (0..n)
        .map(|i| {
            let mut node = ResourceNode::plain(format!("n{i}"));
            for j in 0..i {
                if rng.gen_bool(0.25) {
                    node = if rng.gen_bool(0.5) {
                        node.with_input(format!("from_n{j}"), Value::reference(format!("n{j}"), "id"))
                    } else {
                        node.with_dependency(format!("n{j}"))
                    };
                }
            }
            node
        })
        .collect();
    nodes.shuffle(rng);
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Value;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn ids(graph: &Graph) -> Vec<&str> {
        graph.nodes().iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        let graph = Graph::build(vec![
            ResourceNode::plain("runtime")
                .with_input("image", Value::reference("image", "uri"))
                .with_dependency("auth"),
            ResourceNode::plain("auth"),
            ResourceNode::plain("image").with_input("repo", Value::reference("registry", "url")),
            ResourceNode::plain("registry"),
        ])
        .unwrap();

        let order = ids(&graph);
        let pos = |id: &str| order.iter().position(|n| *n == id).unwrap();
        assert!(pos("registry") < pos("image"));
        assert!(pos("image") < pos("runtime"));
        assert!(pos("auth") < pos("runtime"));
        assert_eq!(graph.dependents("registry"), ["image"]);
    }

    #[test]
    fn test_random_dags_order_dependencies_first() {
        let mut rng = StdRng::seed_from_u64(7);
        for round in 0..200 {
            let n = 1 + round % 25;
            let nodes = random_dag(&mut rng, n);
            let graph = Graph::build(nodes.clone()).unwrap();
            assert_eq!(graph.len(), n);

            for node in &nodes {
                let at = graph.position(&node.id).unwrap();
                for dep in node.depends_on() {
                    let dep_at = graph.position(&dep).unwrap();
                    assert!(dep_at < at, "round {round}: {dep} must precede {}", node.id);
                }
            }
        }
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let graph = Graph::build(vec![
            ResourceNode::plain("c"),
            ResourceNode::plain("a"),
            ResourceNode::plain("b").with_dependency("c"),
            ResourceNode::plain("d"),
        ])
        .unwrap();
        assert_eq!(ids(&graph), vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let err = Graph::build(vec![
            ResourceNode::plain("a").with_dependency("c"),
            ResourceNode::plain("b").with_dependency("a"),
            ResourceNode::plain("c").with_dependency("b"),
        ])
        .unwrap_err();

        match err {
            Error::CycleDetected { path } => {
                assert_eq!(path.len(), 4);
                assert_eq!(path.first(), path.last());
                assert_eq!(path, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let err = Graph::build(vec![
            ResourceNode::plain("a").with_input("x", Value::reference("a", "y")),
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "cycle detected in dependencies: a -> a");
    }

    #[test]
    fn test_cycle_behind_acyclic_prefix() {
        let err = Graph::build(vec![
            ResourceNode::plain("root"),
            ResourceNode::plain("x").with_dependency("root").with_dependency("z"),
            ResourceNode::plain("y").with_dependency("x"),
            ResourceNode::plain("z").with_dependency("y"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));
    }

    #[test]
    fn test_duplicate_and_unknown_ids_rejected() {
        let dup = Graph::build(vec![ResourceNode::plain("a"), ResourceNode::plain("a")]);
        assert!(matches!(dup, Err(Error::InvalidInput(_))));

        let unknown = Graph::build(vec![
            ResourceNode::plain("a").with_input("x", Value::reference("ghost", "out")),
        ]);
        assert!(matches!(unknown, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_empty_graph() {
        let graph = Graph::build(Vec::new()).unwrap();
        assert!(graph.is_empty());
    }
}
