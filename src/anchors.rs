//! Anchor topology: chains, endpoints, head and free/bonded partition.
//!
//! Anchor elements form an undirected graph keyed by node id. Each connected
//! component is one anchor (by convention, even when the shape is odd). The
//! head is the endpoint attached to the wall; nodes close to the head form
//! the free length, the rest is the grouted (bonded) length.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, info, warn};

use crate::{
    classifier::Classification,
    datatypes::{Element, ElementId, ElementKind, MeshSet, NodeArena, NodeId},
    error::Warning,
    spatial::SpatialIndex,
};

/// Policy for combining explicit mesh-set grouping with the geometric rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingPolicy {
    /// Use explicit grouping wherever it touches a component
    #[default]
    PreferExplicit,
    /// Use explicit grouping only when it is consistent, else the geometric rule
    GeometricOverridesInconsistent,
    /// Ignore explicit grouping
    GeometricOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmenterConfig {
    /// Maximum head-to-wall distance for a head to count as attached
    pub head_tolerance: f64,
    /// Distance from the head inside which anchor nodes are free length
    pub free_band: f64,
    pub policy: GroupingPolicy,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        SegmenterConfig {
            head_tolerance: 2.0,
            free_band: 5.0,
            policy: GroupingPolicy::PreferExplicit,
        }
    }
}

/// Keywords identifying free and bonded mesh sets by name
#[derive(Debug, Clone, PartialEq)]
pub struct GroupingKeywords {
    pub free: Vec<String>,
    pub bonded: Vec<String>,
    /// Mesh set ids that are bonded length regardless of their name
    pub bonded_set_ids: Vec<u32>,
}

impl Default for GroupingKeywords {
    fn default() -> Self {
        GroupingKeywords {
            free: vec!["free".into(), "unbonded".into(), "自由".into()],
            bonded: vec![
                "bond".into(),
                "grout".into(),
                "fixed length".into(),
                "锚固".into(),
            ],
            bonded_set_ids: Vec::new(),
        }
    }
}

/// Explicit free/bonded node grouping taken from named mesh sets
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnchorGrouping {
    pub free: BTreeSet<NodeId>,
    pub bonded: BTreeSet<NodeId>,
}

impl AnchorGrouping {
    /// Collects free and bonded nodes from mesh sets whose names carry a
    /// keyword. Elements listed in a set contribute their nodes.
    ///
    /// # Arguments
    /// * `sets` - The named mesh sets
    /// * `elements` - All model elements, to resolve element members
    /// * `keywords` - Name keywords and explicit bonded set ids
    ///
    /// # Returns
    /// The grouping, or None if no set matched
    pub fn from_mesh_sets(
        sets: &[MeshSet],
        elements: &[Element],
        keywords: &GroupingKeywords,
    ) -> Option<AnchorGrouping> {
        let element_nodes: BTreeMap<ElementId, &Vec<NodeId>> =
            elements.iter().map(|e| (e.id, &e.node_ids)).collect();
        let mut grouping = AnchorGrouping::default();

        for set in sets {
            let name = set.name.to_lowercase();
            // Free keywords win, "unbonded" also contains "bond"
            let is_free = keywords.free.iter().any(|k| name.contains(k.as_str()));
            let is_bonded = keywords.bonded_set_ids.contains(&set.id)
                || (!is_free && keywords.bonded.iter().any(|k| name.contains(k.as_str())));

            let target = if is_bonded {
                &mut grouping.bonded
            } else if is_free {
                &mut grouping.free
            } else {
                continue;
            };

            target.extend(set.node_ids.iter().copied());
            for element_id in &set.element_ids {
                if let Some(nodes) = element_nodes.get(element_id) {
                    target.extend(nodes.iter().copied());
                }
            }
            debug!(set = set.id, name = set.name.as_str(), bonded = is_bonded, "anchor mesh set");
        }

        if grouping.free.is_empty() && grouping.bonded.is_empty() {
            None
        } else {
            Some(grouping)
        }
    }

    fn touches(&self, nodes: &BTreeSet<NodeId>) -> bool {
        nodes
            .iter()
            .any(|n| self.free.contains(n) || self.bonded.contains(n))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Simple path with two endpoints
    Chain,
    /// Closed loop without endpoints
    Loop,
    /// Branching or otherwise unexpected shape
    Irregular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSource {
    Explicit,
    Geometric,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnchorComponent {
    pub index: usize,
    pub nodes: BTreeSet<NodeId>,
    pub element_ids: BTreeSet<ElementId>,
    pub node_degree: BTreeMap<NodeId, usize>,
    pub endpoint_nodes: BTreeSet<NodeId>,
    pub topology: Topology,
    pub head_node: NodeId,
    /// Endpoint opposite the head, for chains
    pub tail_node: Option<NodeId>,
    /// Distance from the head to the nearest wall node, if there is a wall
    pub head_distance: Option<f64>,
    pub free_nodes: BTreeSet<NodeId>,
    pub bonded_nodes: BTreeSet<NodeId>,
    pub partition_source: PartitionSource,
    /// Prestress force in newtons applied to this anchor
    pub prestress_n: Option<f64>,
}

impl AnchorComponent {
    /// Number of anchors this component stands for
    pub fn anchor_count(&self) -> usize {
        (self.endpoint_nodes.len() / 2).max(1)
    }
}

/// Undirected anchor graph as id-keyed adjacency sets
#[derive(Debug, Clone, Default)]
pub struct AnchorGraph {
    adjacency: BTreeMap<NodeId, BTreeSet<NodeId>>,
    incident: BTreeMap<NodeId, BTreeSet<ElementId>>,
}

impl AnchorGraph {
    /// Builds the graph from the anchor elements of a classification
    pub fn build(elements: &[Element], classification: &Classification) -> AnchorGraph {
        let mut graph = AnchorGraph::default();

        for element in elements {
            if classification.kind_of(element.id) != ElementKind::Anchor {
                continue;
            }
            let (a, b) = (element.node_ids[0], element.node_ids[1]);
            if a == b {
                debug!(element = element.id, "skipping zero-length anchor element");
                continue;
            }
            graph.adjacency.entry(a).or_default().insert(b);
            graph.adjacency.entry(b).or_default().insert(a);
            graph.incident.entry(a).or_default().insert(element.id);
            graph.incident.entry(b).or_default().insert(element.id);
        }

        graph
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn degree(&self, node: NodeId) -> usize {
        self.adjacency.get(&node).map(|n| n.len()).unwrap_or(0)
    }

    /// Connected components by breadth-first traversal, seeded in ascending
    /// node id order
    pub fn components(&self) -> Vec<BTreeSet<NodeId>> {
        let mut visited: BTreeSet<NodeId> = BTreeSet::new();
        let mut components = Vec::new();

        for &seed in self.adjacency.keys() {
            if visited.contains(&seed) {
                continue;
            }

            let mut component = BTreeSet::new();
            let mut queue = VecDeque::from([seed]);
            visited.insert(seed);

            while let Some(current) = queue.pop_front() {
                component.insert(current);
                for &neighbor in &self.adjacency[&current] {
                    if visited.insert(neighbor) {
                        queue.push_back(neighbor);
                    }
                }
            }

            components.push(component);
        }

        components
    }

    fn elements_of(&self, nodes: &BTreeSet<NodeId>) -> BTreeSet<ElementId> {
        nodes
            .iter()
            .filter_map(|n| self.incident.get(n))
            .flatten()
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Segmentation {
    pub components: Vec<AnchorComponent>,
    pub warnings: Vec<Warning>,
}

impl Segmentation {
    /// Sum over components of `max(1, endpoints / 2)`
    pub fn anchor_count(&self) -> usize {
        self.components.iter().map(|c| c.anchor_count()).sum()
    }

    pub fn head_nodes(&self) -> Vec<NodeId> {
        self.components.iter().map(|c| c.head_node).collect()
    }

    /// All bonded nodes, sorted, each once
    pub fn bonded_nodes(&self) -> Vec<NodeId> {
        let all: BTreeSet<NodeId> = self
            .components
            .iter()
            .flat_map(|c| c.bonded_nodes.iter().copied())
            .collect();
        all.into_iter().collect()
    }

    /// Far-end nodes of every chain
    pub fn tail_nodes(&self) -> Vec<NodeId> {
        self.components.iter().filter_map(|c| c.tail_node).collect()
    }
}

fn classify_topology(degree: &BTreeMap<NodeId, usize>, endpoints: usize) -> Topology {
    let all_inner_two = degree.values().all(|d| *d == 1 || *d == 2);
    match endpoints {
        2 if all_inner_two => Topology::Chain,
        0 if all_inner_two => Topology::Loop,
        _ => Topology::Irregular,
    }
}

/// Picks the head among candidate nodes: nearest to the wall, ties and the
/// no-wall case resolved by the smaller id
fn pick_head(
    candidates: &BTreeSet<NodeId>,
    nodes: &NodeArena,
    wall_index: &SpatialIndex,
) -> Option<(NodeId, Option<f64>)> {
    let mut best: Option<(NodeId, Option<f64>)> = None;

    for &candidate in candidates {
        let distance = nodes
            .position(candidate)
            .and_then(|p| wall_index.nearest(&p))
            .map(|hit| hit.distance);

        best = match (best, distance) {
            (None, d) => Some((candidate, d)),
            (Some((_, Some(best_d))), Some(d)) if d < best_d => Some((candidate, Some(d))),
            (Some((_, None)), Some(d)) => Some((candidate, Some(d))),
            (keep, _) => keep,
        };
    }

    best
}

/// Splits a component into free (within the band around the head) and
/// bonded nodes
fn geometric_partition(
    component: &BTreeSet<NodeId>,
    head: NodeId,
    nodes: &NodeArena,
    free_band: f64,
) -> (BTreeSet<NodeId>, BTreeSet<NodeId>) {
    let mut free = BTreeSet::from([head]);
    let mut bonded = BTreeSet::new();
    let head_position = nodes.position(head);

    for &node in component {
        if node == head {
            continue;
        }
        let within_band = match (head_position, nodes.position(node)) {
            (Some(h), Some(p)) => nalgebra::distance(&h, &p) <= free_band,
            _ => false,
        };
        if within_band {
            free.insert(node);
        } else {
            bonded.insert(node);
        }
    }

    (free, bonded)
}

/// Why explicit grouping cannot be trusted for a component, if it can't
fn explicit_inconsistency(
    component: &BTreeSet<NodeId>,
    endpoints: &BTreeSet<NodeId>,
    grouping: &AnchorGrouping,
) -> Option<String> {
    let both: Vec<NodeId> = component
        .iter()
        .filter(|n| grouping.free.contains(*n) && grouping.bonded.contains(*n))
        .copied()
        .collect();
    if !both.is_empty() {
        return Some(format!("nodes {both:?} are grouped both free and bonded"));
    }
    if !endpoints.is_empty() && endpoints.iter().all(|n| !grouping.free.contains(n)) {
        return Some("no endpoint lies in a free-length group".to_owned());
    }
    None
}

struct Partition {
    head: NodeId,
    head_distance: Option<f64>,
    free: BTreeSet<NodeId>,
    bonded: BTreeSet<NodeId>,
    source: PartitionSource,
}

fn partition_explicit(
    component: &BTreeSet<NodeId>,
    endpoints: &BTreeSet<NodeId>,
    grouping: &AnchorGrouping,
    nodes: &NodeArena,
    wall_index: &SpatialIndex,
    config: &SegmenterConfig,
) -> Option<Partition> {
    let free_endpoints: BTreeSet<NodeId> = endpoints
        .iter()
        .filter(|n| grouping.free.contains(*n))
        .copied()
        .collect();
    let candidates = match (free_endpoints.is_empty(), endpoints.is_empty()) {
        (false, _) => free_endpoints,
        (true, false) => endpoints.clone(),
        (true, true) => component.clone(),
    };
    let (head, head_distance) = pick_head(&candidates, nodes, wall_index)?;

    // Nodes outside both groups follow the band rule
    let (band_free, band_bonded) = geometric_partition(component, head, nodes, config.free_band);
    let mut free = BTreeSet::from([head]);
    let mut bonded = BTreeSet::new();
    for &node in component {
        if node == head {
            continue;
        }
        if grouping.bonded.contains(&node) {
            bonded.insert(node);
        } else if grouping.free.contains(&node) || band_free.contains(&node) {
            free.insert(node);
        } else if band_bonded.contains(&node) {
            bonded.insert(node);
        }
    }

    Some(Partition {
        head,
        head_distance,
        free,
        bonded,
        source: PartitionSource::Explicit,
    })
}

fn partition_geometric(
    component: &BTreeSet<NodeId>,
    endpoints: &BTreeSet<NodeId>,
    nodes: &NodeArena,
    wall_index: &SpatialIndex,
    config: &SegmenterConfig,
) -> Option<Partition> {
    let (head, head_distance) = if endpoints.is_empty() {
        // Closed loop: any node will do, take the smallest id
        let head = *component.iter().next()?;
        let distance = nodes
            .position(head)
            .and_then(|p| wall_index.nearest(&p))
            .map(|hit| hit.distance);
        (head, distance)
    } else {
        pick_head(endpoints, nodes, wall_index)?
    };

    let (free, bonded) = geometric_partition(component, head, nodes, config.free_band);

    Some(Partition {
        head,
        head_distance,
        free,
        bonded,
        source: PartitionSource::Geometric,
    })
}

/// Segments the anchor graph into components with head, free and bonded
/// nodes
///
/// # Arguments
/// * `elements` - All model elements
/// * `classification` - Kind labels for the elements
/// * `nodes` - The node arena
/// * `wall_index` - Spatial index over the wall nodes
/// * `grouping` - Explicit free/bonded grouping, if ingestion supplied one
/// * `config` - Tolerances and grouping policy
///
/// # Returns
/// The components with their partitions, plus any degenerate-shape warnings
pub fn segment(
    elements: &[Element],
    classification: &Classification,
    nodes: &NodeArena,
    wall_index: &SpatialIndex,
    grouping: Option<&AnchorGrouping>,
    config: &SegmenterConfig,
) -> Segmentation {
    let graph = AnchorGraph::build(elements, classification);
    let mut segmentation = Segmentation::default();

    let grouping = match config.policy {
        GroupingPolicy::GeometricOnly => None,
        _ => grouping,
    };

    for (index, component) in graph.components().into_iter().enumerate() {
        let node_degree: BTreeMap<NodeId, usize> =
            component.iter().map(|&n| (n, graph.degree(n))).collect();
        let endpoint_nodes: BTreeSet<NodeId> = node_degree
            .iter()
            .filter(|(_, d)| **d == 1)
            .map(|(n, _)| *n)
            .collect();
        let topology = classify_topology(&node_degree, endpoint_nodes.len());

        match topology {
            Topology::Chain => {}
            Topology::Loop => {
                debug!(component = index, "closed anchor loop, treated as one anchor")
            }
            Topology::Irregular => {
                let node_list: Vec<NodeId> = component.iter().copied().collect();
                warn!(
                    component = index,
                    endpoints = endpoint_nodes.len(),
                    "branching anchor component, assuming a single anchor: {node_list:?}"
                );
                segmentation.warnings.push(Warning::SegmentationDegenerate {
                    component: index,
                    endpoint_count: endpoint_nodes.len(),
                    nodes: node_list,
                    reason: "branching anchor topology".to_owned(),
                });
            }
        }

        let explicit = match grouping {
            Some(g) if g.touches(&component) => match config.policy {
                GroupingPolicy::GeometricOverridesInconsistent => {
                    match explicit_inconsistency(&component, &endpoint_nodes, g) {
                        Some(reason) => {
                            warn!(
                                component = index,
                                "explicit anchor grouping overridden: {reason}"
                            );
                            segmentation.warnings.push(Warning::SegmentationDegenerate {
                                component: index,
                                endpoint_count: endpoint_nodes.len(),
                                nodes: component.iter().copied().collect(),
                                reason: format!("inconsistent explicit grouping, {reason}"),
                            });
                            None
                        }
                        None => Some(g),
                    }
                }
                _ => Some(g),
            },
            _ => None,
        };

        let partition = match explicit {
            Some(g) => {
                partition_explicit(&component, &endpoint_nodes, g, nodes, wall_index, config)
            }
            None => partition_geometric(&component, &endpoint_nodes, nodes, wall_index, config),
        };
        let Some(partition) = partition else {
            continue;
        };

        match partition.head_distance {
            Some(d) if d > config.head_tolerance => warn!(
                component = index,
                head = partition.head,
                "anchor head is {d:.2} from the wall, beyond tolerance {:.2}",
                config.head_tolerance
            ),
            None => warn!(component = index, "no wall nodes, anchor head chosen by id"),
            _ => {}
        }

        let tail_node = match topology {
            Topology::Chain => endpoint_nodes
                .iter()
                .find(|n| **n != partition.head)
                .copied(),
            _ => None,
        };

        segmentation.components.push(AnchorComponent {
            index,
            element_ids: graph.elements_of(&component),
            nodes: component,
            node_degree,
            endpoint_nodes,
            topology,
            head_node: partition.head,
            tail_node,
            head_distance: partition.head_distance,
            free_nodes: partition.free,
            bonded_nodes: partition.bonded,
            partition_source: partition.source,
            prestress_n: None,
        });
    }

    info!(
        "segmented {} anchor node(s) into {} component(s), {} anchor(s)",
        graph.node_count(),
        segmentation.components.len(),
        segmentation.anchor_count()
    );

    segmentation
}

/// Propagates per-element prestress to the whole anchor containing the
/// element. The last force listed for a component wins.
///
/// # Arguments
/// * `components` - The segmented anchors
/// * `element_forces` - Prestress in newtons keyed by anchor element
pub fn assign_prestress(
    components: &mut [AnchorComponent],
    element_forces: &BTreeMap<ElementId, f64>,
) {
    for component in components.iter_mut() {
        for element in &component.element_ids {
            if let Some(force) = element_forces.get(element) {
                component.prestress_n = Some(*force);
            }
        }
    }
}

/// Groups prestressed components by force rounded to the newton
pub fn prestress_groups(components: &[AnchorComponent]) -> BTreeMap<i64, Vec<usize>> {
    let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for component in components {
        if let Some(force) = component.prestress_n {
            groups
                .entry(force.round() as i64)
                .or_default()
                .push(component.index);
        }
    }
    groups
}
