/// Pipeline graph ordering
///
/// Builds a petgraph DAG from parent and depends_on edges and produces the
/// execution order. Unknown references and cycles are rejected instead of
/// producing an order that silently violates parent-before-child.

use crate::workflow::types::PipelineSpec;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate pipeline id: {0}")]
    DuplicatePipeline(String),

    #[error("pipeline '{pipeline}' references unknown pipeline '{missing}'")]
    UnknownReference { pipeline: String, missing: String },

    #[error("pipeline graph contains a cycle through '{0}'")]
    Cycle(String),
}

/// Pipeline specs in dependency order
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    ordered: Vec<PipelineSpec>,
    levels: Vec<Vec<PipelineSpec>>,
}

impl PipelineGraph {
    /// Order `specs` so every pipeline follows its parent and all depends_on entries
    ///
    /// Pipelines without an ordering constraint keep their relative input order.
    pub fn build(specs: &[PipelineSpec]) -> Result<Self, GraphError> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();

        for (position, spec) in specs.iter().enumerate() {
            let node = graph.add_node(position);
            if index_of.insert(spec.id.as_str(), node).is_some() {
                return Err(GraphError::DuplicatePipeline(spec.id.clone()));
            }
        }

        for spec in specs {
            let to = index_of[spec.id.as_str()];
            for prerequisite in spec.prerequisites() {
                let from = index_of.get(prerequisite).ok_or_else(|| GraphError::UnknownReference {
                    pipeline: spec.id.clone(),
                    missing: prerequisite.to_string(),
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(specs[graph[cycle.node_id()]].id.clone()))?;

        // Level = longest prerequisite chain; nodes of one level are independent
        let mut level_of: HashMap<NodeIndex, usize> = HashMap::new();
        let mut positions: Vec<Vec<usize>> = Vec::new();
        for &node in &order {
            let level = graph
                .neighbors_directed(node, petgraph::Direction::Incoming)
                .map(|parent| level_of[&parent] + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(node, level);
            if positions.len() <= level {
                positions.resize_with(level + 1, Vec::new);
            }
            positions[level].push(graph[node]);
        }

        let levels: Vec<Vec<PipelineSpec>> = positions
            .into_iter()
            .map(|mut level| {
                level.sort_unstable();
                level.into_iter().map(|position| specs[position].clone()).collect()
            })
            .collect();
        let ordered: Vec<PipelineSpec> = levels.iter().flatten().cloned().collect();
        tracing::debug!(
            "📋 Pipeline order: {:?}",
            ordered.iter().map(|spec| spec.id.as_str()).collect::<Vec<_>>()
        );

        Ok(Self { ordered, levels })
    }

    /// Topological order, one pipeline at a time
    pub fn ordered(&self) -> &[PipelineSpec] {
        &self.ordered
    }

    /// Groups of mutually independent pipelines, in dependency order
    pub fn levels(&self) -> &[Vec<PipelineSpec>] {
        &self.levels
    }

    /// Whether any pipeline names `pipeline_id` as its parent
    pub fn has_children(&self, pipeline_id: &str) -> bool {
        self.ordered.iter().any(|spec| spec.parent() == Some(pipeline_id))
    }

    pub fn get(&self, pipeline_id: &str) -> Option<&PipelineSpec> {
        self.ordered.iter().find(|spec| spec.id == pipeline_id)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
