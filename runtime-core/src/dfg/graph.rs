use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Index of a node in the [`DataflowGraph`] arena.
pub type NodeId = usize;

/// Static definition of one model function call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfcDef {
    /// Unique node name.
    pub name: String,
    /// Model whose shards execute this call.
    pub model_name: String,
    /// Operation name sent to the shards.
    pub interface: String,
    /// Keys each sample must carry before this call can run.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Keys this call adds to each sample.
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Number of samples consumed per step.
    pub n_seqs: usize,
}

impl MfcDef {
    pub fn new(
        name: impl Into<String>,
        model_name: impl Into<String>,
        interface: impl Into<String>,
        n_seqs: usize,
    ) -> Self {
        Self {
            name: name.into(),
            model_name: model_name.into(),
            interface: interface.into(),
            input_keys: Vec::new(),
            output_keys: Vec::new(),
            n_seqs,
        }
    }

    pub fn with_input_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_keys = keys.into_iter().map(Into::into).collect();
        self
    }
}

/// A node of the graph with its resolved topology.
#[derive(Debug, Clone)]
pub struct MfcNode {
    pub id: NodeId,
    pub def: MfcDef,
    pub parents: Vec<NodeId>,
    pub children: Vec<NodeId>,
    /// Depth in the dependency order; 0 for nodes without parents.
    pub generation: usize,
}

impl MfcNode {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// True if the node has no predecessors.
    pub fn is_src(&self) -> bool {
        self.parents.is_empty()
    }

    /// True if the node has no successors.
    pub fn is_dst(&self) -> bool {
        self.children.is_empty()
    }
}

/// Directed acyclic graph of MFCs with precomputed topological generations.
#[derive(Debug, Clone)]
pub struct DataflowGraph {
    nodes: Vec<MfcNode>,
    generations: Vec<Vec<NodeId>>,
    by_name: HashMap<String, NodeId>,
}

impl DataflowGraph {
    /// Build the graph from node definitions.
    ///
    /// # Errors
    ///
    /// Fails on empty input, duplicate node names, a key produced by more than
    /// one node, or a dependency cycle.
    pub fn build(defs: Vec<MfcDef>) -> Result<Self> {
        if defs.is_empty() {
            return Err(RuntimeError::graph("graph has no nodes"));
        }

        let mut by_name = HashMap::new();
        for (id, def) in defs.iter().enumerate() {
            if def.n_seqs == 0 {
                return Err(RuntimeError::graph(format!(
                    "node '{}' must consume at least one sample",
                    def.name
                )));
            }
            if by_name.insert(def.name.clone(), id).is_some() {
                return Err(RuntimeError::graph(format!("duplicate node name '{}'", def.name)));
            }
        }

        let mut producers: HashMap<&str, NodeId> = HashMap::new();
        for (id, def) in defs.iter().enumerate() {
            for key in &def.output_keys {
                if let Some(prev) = producers.insert(key.as_str(), id) {
                    return Err(RuntimeError::graph(format!(
                        "key '{}' is produced by both '{}' and '{}'",
                        key, defs[prev].name, def.name
                    )));
                }
            }
        }

        let mut parents: Vec<Vec<NodeId>> = vec![Vec::new(); defs.len()];
        let mut children: Vec<Vec<NodeId>> = vec![Vec::new(); defs.len()];
        for (id, def) in defs.iter().enumerate() {
            let mut seen = HashSet::new();
            for key in &def.input_keys {
                if let Some(&p) = producers.get(key.as_str()) {
                    if p == id {
                        return Err(RuntimeError::graph(format!(
                            "node '{}' consumes its own output '{}'",
                            def.name, key
                        )));
                    }
                    if seen.insert(p) {
                        parents[id].push(p);
                        children[p].push(id);
                    }
                }
            }
        }

        // Kahn's algorithm, one generation per round.
        let mut in_degree: Vec<usize> = parents.iter().map(Vec::len).collect();
        let mut generation_of = vec![0usize; defs.len()];
        let mut generations: Vec<Vec<NodeId>> = Vec::new();
        let mut frontier: Vec<NodeId> = (0..defs.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;

        while !frontier.is_empty() {
            let level = generations.len();
            let mut next = Vec::new();
            for &id in &frontier {
                generation_of[id] = level;
                visited += 1;
                for &child in &children[id] {
                    in_degree[child] -= 1;
                    if in_degree[child] == 0 {
                        next.push(child);
                    }
                }
            }
            generations.push(std::mem::take(&mut frontier));
            next.sort_unstable();
            frontier = next;
        }

        if visited != defs.len() {
            let cyclic: Vec<&str> = (0..defs.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| defs[i].name.as_str())
                .collect();
            return Err(RuntimeError::graph(format!(
                "dependency cycle among nodes {:?}",
                cyclic
            )));
        }

        let nodes = defs
            .into_iter()
            .enumerate()
            .map(|(id, def)| MfcNode {
                id,
                def,
                parents: std::mem::take(&mut parents[id]),
                children: std::mem::take(&mut children[id]),
                generation: generation_of[id],
            })
            .collect();

        Ok(Self {
            nodes,
            generations,
            by_name,
        })
    }

    pub fn nodes(&self) -> &[MfcNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &MfcNode {
        &self.nodes[id]
    }

    pub fn get(&self, name: &str) -> Option<&MfcNode> {
        self.by_name.get(name).map(|&id| &self.nodes[id])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids grouped by topological generation.
    pub fn generations(&self) -> &[Vec<NodeId>] {
        &self.generations
    }

    /// Number of nodes in each generation, in order.
    pub fn topo_widths(&self) -> Vec<usize> {
        self.generations.iter().map(Vec::len).collect()
    }

    pub fn sources(&self) -> impl Iterator<Item = &MfcNode> {
        self.nodes.iter().filter(|n| n.is_src())
    }

    pub fn leaves(&self) -> impl Iterator<Item = &MfcNode> {
        self.nodes.iter().filter(|n| n.is_dst())
    }

    /// Input keys no node produces; they must come from the dataset.
    pub fn dataset_keys(&self) -> Vec<String> {
        let produced: HashSet<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.def.output_keys.iter().map(String::as_str))
            .collect();
        let mut keys: Vec<String> = self
            .nodes
            .iter()
            .flat_map(|n| n.def.input_keys.iter())
            .filter(|k| !produced.contains(k.as_str()))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Largest per-step sample requirement across all nodes.
    pub fn max_n_seqs(&self) -> usize {
        self.nodes.iter().map(|n| n.def.n_seqs).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ppo_like() -> Vec<MfcDef> {
        vec![
            MfcDef::new("actor_gen", "actor", "generate", 4)
                .with_input_keys(["prompts"])
                .with_output_keys(["seqs", "logprobs"]),
            MfcDef::new("ref_inf", "ref", "inference", 4)
                .with_input_keys(["seqs"])
                .with_output_keys(["ref_logprobs"]),
            MfcDef::new("rew_inf", "reward", "inference", 4)
                .with_input_keys(["seqs"])
                .with_output_keys(["rewards"]),
            MfcDef::new("actor_train", "actor", "train_step", 4)
                .with_input_keys(["seqs", "logprobs", "ref_logprobs", "rewards"]),
        ]
    }

    #[test]
    fn test_generations_and_flags() {
        let graph = DataflowGraph::build(ppo_like()).unwrap();

        assert_eq!(graph.topo_widths(), vec![1, 2, 1]);
        assert_eq!(graph.generations()[1], vec![1, 2]);

        let train = graph.get("actor_train").unwrap();
        assert_eq!(train.generation, 2);
        assert_eq!(train.parents, vec![0, 1, 2]);
        assert!(train.is_dst());

        let sources: Vec<_> = graph.sources().map(|n| n.name()).collect();
        assert_eq!(sources, vec!["actor_gen"]);
        let leaves: Vec<_> = graph.leaves().map(|n| n.name()).collect();
        assert_eq!(leaves, vec!["actor_train"]);
        assert_eq!(graph.dataset_keys(), vec!["prompts"]);
    }

    #[test]
    fn test_independent_roots_share_generation() {
        let graph = DataflowGraph::build(vec![
            MfcDef::new("a", "m1", "inference", 2).with_input_keys(["x"]).with_output_keys(["ya"]),
            MfcDef::new("b", "m2", "inference", 2).with_input_keys(["x"]).with_output_keys(["yb"]),
            MfcDef::new("c", "m3", "train_step", 2).with_input_keys(["ya", "yb"]),
        ])
        .unwrap();

        assert_eq!(graph.topo_widths(), vec![2, 1]);
        assert_eq!(graph.max_n_seqs(), 2);
    }

    #[test]
    fn test_single_node_is_src_and_dst() {
        let graph = DataflowGraph::build(vec![MfcDef::new("only", "m", "train_step", 4)]).unwrap();
        let node = graph.node(0);
        assert!(node.is_src());
        assert!(node.is_dst());
        assert_eq!(graph.topo_widths(), vec![1]);
    }

    #[test]
    fn test_cycle_rejected() {
        let result = DataflowGraph::build(vec![
            MfcDef::new("a", "m", "f", 1).with_input_keys(["y"]).with_output_keys(["x"]),
            MfcDef::new("b", "m", "g", 1).with_input_keys(["x"]).with_output_keys(["y"]),
        ]);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_duplicate_producer_rejected() {
        let result = DataflowGraph::build(vec![
            MfcDef::new("a", "m", "f", 1).with_output_keys(["x"]),
            MfcDef::new("b", "m", "g", 1).with_output_keys(["x"]),
        ]);
        assert!(matches!(result, Err(RuntimeError::Graph { .. })));
    }

    #[test]
    fn test_duplicate_name_and_empty_rejected() {
        assert!(DataflowGraph::build(vec![]).is_err());
        assert!(DataflowGraph::build(vec![
            MfcDef::new("a", "m", "f", 1),
            MfcDef::new("a", "m", "g", 1),
        ])
        .is_err());
    }
}
