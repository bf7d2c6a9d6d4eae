use std::collections::{BTreeMap, BTreeSet, HashMap};

use nalgebra::Point3;

use crate::error::{Result, StagingError};

pub type NodeId = u64;
pub type ElementId = u64;
pub type MaterialId = u32;
pub type GroupId = u32;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub position: Point3<f64>,
}

/// Arena of nodes with an id index. Everything else refers to nodes by id.
#[derive(Debug, Clone, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
}

impl NodeArena {
    pub fn new() -> NodeArena {
        NodeArena::default()
    }

    /// Builds an arena from a list of nodes
    ///
    /// # Arguments
    /// * `nodes` - The nodes, in any order
    ///
    /// # Returns
    /// The arena, or an input error if two nodes share an id
    pub fn from_nodes(nodes: Vec<Node>) -> Result<NodeArena> {
        let mut arena = NodeArena {
            nodes: Vec::with_capacity(nodes.len()),
            index: HashMap::with_capacity(nodes.len()),
        };
        for node in nodes {
            arena.insert(node)?;
        }
        Ok(arena)
    }

    pub fn insert(&mut self, node: Node) -> Result<()> {
        if self.index.contains_key(&node.id) {
            return Err(StagingError::Input(format!(
                "Duplicate node id {}",
                node.id
            )));
        }
        self.index.insert(node.id, self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.index.get(&id).map(|&slot| &self.nodes[slot])
    }

    pub fn position(&self, id: NodeId) -> Option<Point3<f64>> {
        self.get(id).map(|n| n.position)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }
}

/// Derived element category. Never read from input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    Soil,
    Wall,
    Anchor,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub id: ElementId,
    pub type_tag: String,
    pub node_ids: Vec<NodeId>,
    pub material_id: MaterialId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialCategory {
    Cohesive,
    Granular,
    /// Concrete or steel support material, kept linear elastic
    Structural,
}

impl MaterialCategory {
    pub fn parse(value: &str) -> Option<MaterialCategory> {
        match value.trim().to_lowercase().as_str() {
            "cohesive" | "clay" | "silt" => Some(MaterialCategory::Cohesive),
            "granular" | "sand" | "gravel" => Some(MaterialCategory::Granular),
            "structural" | "concrete" | "steel" => Some(MaterialCategory::Structural),
            _ => None,
        }
    }
}

/// Raw material table row as delivered by ingestion
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialRecord {
    pub material_id: MaterialId,
    pub friction_deg: f64,
    pub cohesion_pa: f64,
    pub category: MaterialCategory,
    pub elastic_modulus: f64,
    pub poisson_ratio: f64,
    pub density: f64,
}

/// A named node/element group from the source model
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshSet {
    pub id: u32,
    pub name: String,
    pub node_ids: Vec<NodeId>,
    pub element_ids: Vec<ElementId>,
}

/// Everything ingestion hands over
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub nodes: NodeArena,
    pub elements: Vec<Element>,
    pub materials: Vec<MaterialRecord>,
    pub mesh_sets: Vec<MeshSet>,
    pub load_groups: BTreeSet<GroupId>,
    pub boundary_groups: BTreeSet<GroupId>,
    /// Prestress force in newtons, keyed by anchor element
    pub anchor_prestress: BTreeMap<ElementId, f64>,
}

impl Model {
    /// Checks that every element refers to existing nodes
    pub fn validate(&self) -> Result<()> {
        let mut seen: BTreeSet<ElementId> = BTreeSet::new();
        for element in &self.elements {
            if !seen.insert(element.id) {
                return Err(StagingError::Input(format!(
                    "Duplicate element id {}",
                    element.id
                )));
            }
            if let Some(missing) = element.node_ids.iter().find(|n| !self.nodes.contains(**n)) {
                return Err(StagingError::Input(format!(
                    "Element {} references missing node {missing}",
                    element.id
                )));
            }
        }
        Ok(())
    }

    pub fn element_ids(&self) -> BTreeSet<ElementId> {
        self.elements.iter().map(|e| e.id).collect()
    }

    /// Material ids carried by at least one element
    pub fn material_ids(&self) -> BTreeSet<MaterialId> {
        self.elements.iter().map(|e| e.material_id).collect()
    }
}
