//! ABOUTME: The build plan DAG: nodes, input references, and structural checks
//! ABOUTME: Nodes are emitted pre-sorted; validation re-proves the invariants

use crate::komposition::{KompositionMetadata, MusicalRole};
use ko_core::{Error, Id, Result};
use ko_ops::Operation;
use ko_registry::FileId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An input to a plan node: a prior node's output or a registered file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "snake_case")]
pub enum NodeInput {
    Node(String),
    File(FileId),
}

/// Output naming for a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Produces {
    pub name: String,
    pub ext: String,
}

/// One concrete operation in the DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub op: Operation,
    pub inputs: Vec<NodeInput>,
    pub produces: Produces,
    pub estimated_cost_s: f64,
}

/// Per-segment bindings carried through compilation so a plan can be
/// serialized back into the komposition it came from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentBinding {
    pub segment_id: Option<String>,
    pub role: Option<MusicalRole>,
}

/// A compiled, topologically ordered build plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPlan {
    pub id: Id,
    pub metadata: KompositionMetadata,
    pub nodes: Vec<PlanNode>,
    pub segment_bindings: Vec<SegmentBinding>,
    pub music_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effects_tree: Option<serde_json::Value>,
    /// Unknown komposition fields, preserved for decompilation
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub total_estimated_cost_s: f64,
}

impl BuildPlan {
    /// The single terminal node (no other node consumes it)
    pub fn terminal(&self) -> Option<&PlanNode> {
        let consumed: HashSet<&str> = self
            .nodes
            .iter()
            .flat_map(|node| node.inputs.iter())
            .filter_map(|input| match input {
                NodeInput::Node(id) => Some(id.as_str()),
                NodeInput::File(_) => None,
            })
            .collect();
        let mut terminals = self.nodes.iter().filter(|node| !consumed.contains(node.id.as_str()));
        match (terminals.next(), terminals.next()) {
            (Some(node), None) => Some(node),
            _ => None,
        }
    }

    /// Prove the DAG invariants: unique ids, references to prior nodes only
    /// (which implies acyclicity in emission order), exactly one terminal
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            for input in &node.inputs {
                if let NodeInput::Node(reference) = input {
                    if !seen.contains(reference.as_str()) {
                        return Err(Error::PlanCompile(format!(
                            "node {} references {} before it is produced",
                            node.id, reference
                        )));
                    }
                }
            }
            if !seen.insert(&node.id) {
                return Err(Error::PlanCompile(format!("duplicate node id {}", node.id)));
            }
        }
        if self.terminal().is_none() {
            return Err(Error::PlanCompile(
                "plan must have exactly one terminal node".to_string(),
            ));
        }
        Ok(())
    }

    /// Every registered file the plan reads
    pub fn input_files(&self) -> Vec<&FileId> {
        self.nodes
            .iter()
            .flat_map(|node| node.inputs.iter())
            .filter_map(|input| match input {
                NodeInput::File(id) => Some(id),
                NodeInput::Node(_) => None,
            })
            .collect()
    }
}
