//! Labels raw elements as soil, wall or anchor.
//!
//! Type tags are heuristic, so classification looks at both the tag family
//! and the node count. Everything downstream matches on [`ElementKind`].

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::{
    datatypes::{Element, ElementId, ElementKind, MaterialId, NodeId},
    error::Warning,
};

const ANCHOR_TAGS: [&str; 5] = ["line", "truss", "cable", "rod", "anchor"];
const WALL_TAGS: [&str; 5] = ["shell", "plate", "membrane", "triangle", "quadrilateral"];
const SOIL_TAGS: [&str; 7] = [
    "solid",
    "tetra",
    "hexa",
    "wedge",
    "prism",
    "brick",
    "smalldisplacement",
];

/// Result of classifying one element
#[derive(Debug, Clone, PartialEq)]
pub enum TagVerdict {
    Kind(ElementKind),
    Ambiguous(String),
}

/// Node sets shared between two entity classes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfaceOverlap {
    pub wall_anchor: BTreeSet<NodeId>,
    pub soil_anchor: BTreeSet<NodeId>,
    pub soil_wall: BTreeSet<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub kinds: BTreeMap<ElementId, ElementKind>,
    pub soil_nodes: BTreeSet<NodeId>,
    pub wall_nodes: BTreeSet<NodeId>,
    pub anchor_nodes: BTreeSet<NodeId>,
    pub unknown_elements: Vec<ElementId>,
    pub support_materials: BTreeSet<MaterialId>,
    pub warnings: Vec<Warning>,
}

impl Classification {
    pub fn kind_of(&self, element: ElementId) -> ElementKind {
        self.kinds
            .get(&element)
            .copied()
            .unwrap_or(ElementKind::Unknown)
    }

    pub fn count(&self, kind: ElementKind) -> usize {
        self.kinds.values().filter(|k| **k == kind).count()
    }

    /// Shared nodes per interface. A non-empty set means the meshes are
    /// already connected there.
    pub fn overlap(&self) -> InterfaceOverlap {
        InterfaceOverlap {
            wall_anchor: self
                .wall_nodes
                .intersection(&self.anchor_nodes)
                .copied()
                .collect(),
            soil_anchor: self
                .soil_nodes
                .intersection(&self.anchor_nodes)
                .copied()
                .collect(),
            soil_wall: self
                .soil_nodes
                .intersection(&self.wall_nodes)
                .copied()
                .collect(),
        }
    }

    /// Material ids carried by wall or anchor elements
    pub fn support_materials(&self) -> &BTreeSet<MaterialId> {
        &self.support_materials
    }
}

fn matches_any(tag: &str, family: &[&str]) -> bool {
    family.iter().any(|needle| tag.contains(needle))
}

/// Classifies a single element from its type tag and node count
///
/// # Arguments
/// * `type_tag` - The raw type tag from ingestion
/// * `node_count` - The number of nodes of the element
///
/// # Returns
/// The element kind, or the reason the element is ambiguous
pub fn classify_tag(type_tag: &str, node_count: usize) -> TagVerdict {
    let tag = type_tag.trim().to_lowercase();
    if tag.is_empty() {
        return TagVerdict::Ambiguous("missing type tag".to_owned());
    }

    let mut families: Vec<ElementKind> = Vec::new();
    if matches_any(&tag, &ANCHOR_TAGS) {
        families.push(ElementKind::Anchor);
    }
    if matches_any(&tag, &WALL_TAGS) {
        families.push(ElementKind::Wall);
    }
    if matches_any(&tag, &SOIL_TAGS) {
        families.push(ElementKind::Soil);
    }

    let family = match families.as_slice() {
        [] => return TagVerdict::Ambiguous("unrecognised type tag".to_owned()),
        [single] => *single,
        _ => {
            return TagVerdict::Ambiguous(format!(
                "contradictory type tag matches {families:?}"
            ))
        }
    };

    let count_ok = match family {
        ElementKind::Anchor => node_count == 2,
        ElementKind::Wall => (3..=4).contains(&node_count),
        ElementKind::Soil => node_count >= 4,
        ElementKind::Unknown => false,
    };

    if count_ok {
        TagVerdict::Kind(family)
    } else {
        TagVerdict::Ambiguous(format!(
            "{family:?}-like tag with {node_count} node(s)"
        ))
    }
}

/// Classifies every element and builds the per-kind node sets
///
/// # Arguments
/// * `elements` - The raw elements
///
/// # Returns
/// A Classification. Unknown elements are listed and warned about, never
/// dropped.
pub fn classify(elements: &[Element]) -> Classification {
    let mut classification = Classification::default();

    for element in elements {
        let kind = match classify_tag(&element.type_tag, element.node_ids.len()) {
            TagVerdict::Kind(kind) => kind,
            TagVerdict::Ambiguous(reason) => {
                warn!(
                    element = element.id,
                    tag = element.type_tag.as_str(),
                    "classification ambiguous: {reason}"
                );
                classification.warnings.push(Warning::ClassificationAmbiguous {
                    element_id: element.id,
                    type_tag: element.type_tag.clone(),
                    reason,
                });
                classification.unknown_elements.push(element.id);
                ElementKind::Unknown
            }
        };

        let target = match kind {
            ElementKind::Soil => Some(&mut classification.soil_nodes),
            ElementKind::Wall => Some(&mut classification.wall_nodes),
            ElementKind::Anchor => Some(&mut classification.anchor_nodes),
            ElementKind::Unknown => None,
        };
        if let Some(set) = target {
            set.extend(element.node_ids.iter().copied());
        }
        if matches!(kind, ElementKind::Wall | ElementKind::Anchor) {
            classification.support_materials.insert(element.material_id);
        }

        classification.kinds.insert(element.id, kind);
    }

    let overlap = classification.overlap();
    debug!(
        wall_anchor = overlap.wall_anchor.len(),
        soil_anchor = overlap.soil_anchor.len(),
        soil_wall = overlap.soil_wall.len(),
        "shared interface nodes"
    );
    info!(
        "classified {} soil, {} wall, {} anchor and {} unknown elements",
        classification.count(ElementKind::Soil),
        classification.count(ElementKind::Wall),
        classification.count(ElementKind::Anchor),
        classification.unknown_elements.len()
    );

    classification
}
