//! Multi-point constraints tying anchor nodes to nearby wall and soil nodes.
//!
//! Each slave node gets up to `k` masters found in an R-tree over the target
//! entity class, weighted by inverse distance. Queries for different slaves
//! are independent and run on the rayon pool against the shared read-only
//! index.

use std::collections::BTreeSet;

use indicatif::{ParallelProgressIterator, ProgressBar};
use nalgebra::Point3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    anchors::Segmentation,
    datatypes::{NodeArena, NodeId},
    error::Warning,
    spatial::{Neighbor, SpatialIndex},
};

/// Translational degree of freedom
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dof {
    X,
    Y,
    Z,
}

impl Dof {
    pub fn label(&self) -> &'static str {
        match self {
            Dof::X => "DISPLACEMENT_X",
            Dof::Y => "DISPLACEMENT_Y",
            Dof::Z => "DISPLACEMENT_Z",
        }
    }
}

pub const TRANSLATIONAL_DOFS: [Dof; 3] = [Dof::X, Dof::Y, Dof::Z];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CouplingKind {
    /// Anchor head tied to the wall
    HeadToWall,
    /// Grouted anchor length tied to the surrounding soil
    BondedToSoil,
}

impl CouplingKind {
    pub fn label(&self) -> &'static str {
        match self {
            CouplingKind::HeadToWall => "head_to_wall",
            CouplingKind::BondedToSoil => "bonded_to_soil",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Master {
    pub node: NodeId,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub slave_node: NodeId,
    pub dofs: [Dof; 3],
    pub masters: Vec<Master>,
    pub coupling: CouplingKind,
}

impl Constraint {
    pub fn weight_sum(&self) -> f64 {
        self.masters.iter().map(|m| m.weight).sum()
    }

    /// Restricts the masters to a node subset and renormalises the weights
    ///
    /// # Arguments
    /// * `keep` - Predicate selecting the masters that remain
    ///
    /// # Returns
    /// The reduced constraint, or None if no master remains
    pub fn retain_masters<F>(&self, keep: F) -> Option<Constraint>
    where
        F: Fn(NodeId) -> bool,
    {
        let kept: Vec<Master> = self.masters.iter().filter(|m| keep(m.node)).copied().collect();
        let total: f64 = kept.iter().map(|m| m.weight).sum();
        if kept.is_empty() || total <= 0.0 {
            return None;
        }

        Some(Constraint {
            slave_node: self.slave_node,
            dofs: self.dofs,
            masters: kept
                .into_iter()
                .map(|m| Master {
                    node: m.node,
                    weight: m.weight / total,
                })
                .collect(),
            coupling: self.coupling,
        })
    }
}

/// Neighbour search settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SearchParams {
    pub k: usize,
    pub search_radius: f64,
    /// Heads whose nearest wall master is farther than this are reported
    pub projection_tolerance: f64,
    pub max_search_radius: f64,
    pub growth_factor: f64,
    /// Lower bound on distances in the inverse-distance weights
    pub min_distance: f64,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            k: 8,
            search_radius: 20.0,
            projection_tolerance: 2.0,
            max_search_radius: 50.0,
            growth_factor: 2.0,
            min_distance: 1e-12,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisReport {
    pub heads: usize,
    pub bonded: usize,
    pub head_to_wall: usize,
    pub bonded_to_soil: usize,
    /// Slaves already shared with the target mesh
    pub coincident: usize,
    pub unreachable: usize,
    pub heads_beyond_tolerance: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    pub wall_anchor: Vec<Constraint>,
    pub anchor_soil: Vec<Constraint>,
    pub report: SynthesisReport,
    pub warnings: Vec<Warning>,
}

impl ConstraintSet {
    /// Every constraint, head-to-wall first
    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.wall_anchor.iter().chain(self.anchor_soil.iter())
    }

    pub fn len(&self) -> usize {
        self.wall_anchor.len() + self.anchor_soil.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Normalised inverse-distance weights
///
/// # Arguments
/// * `neighbors` - Master candidates with their distances
/// * `min_distance` - Floor applied to each distance
///
/// # Returns
/// One master per candidate, weights summing to one
pub fn inverse_distance_weights(neighbors: &[Neighbor], min_distance: f64) -> Vec<Master> {
    let floor = min_distance.max(f64::MIN_POSITIVE);
    let distances: Vec<f64> = neighbors.iter().map(|n| n.distance.max(floor)).collect();
    let nearest = distances.iter().copied().fold(f64::INFINITY, f64::min);

    // Scaled by the nearest distance so every raw weight lies in (0, 1]
    let raw: Vec<f64> = distances.iter().map(|d| nearest / d).collect();
    let total: f64 = raw.iter().sum();

    neighbors
        .iter()
        .zip(raw)
        .map(|(n, w)| Master {
            node: n.node,
            weight: w / total,
        })
        .collect()
}

/// k-NN search that widens the radius until something is found
///
/// # Returns
/// The candidates and the last radius tried
fn search_growing(
    index: &SpatialIndex,
    point: &Point3<f64>,
    params: &SearchParams,
) -> (Vec<Neighbor>, f64) {
    let mut radius = params.search_radius.min(params.max_search_radius);
    loop {
        let found = index.k_nearest_within(point, params.k, radius);
        if !found.is_empty() || radius.is_nan() || radius >= params.max_search_radius {
            return (found, radius);
        }
        let next = (radius * params.growth_factor).min(params.max_search_radius);
        if next.is_nan() || next <= radius {
            debug!("search radius stuck at {radius}, giving up");
            return (found, radius);
        }
        radius = next;
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SlaveOutcome {
    Constrained {
        constraint: Constraint,
        nearest: f64,
    },
    Coincident,
    Unreachable {
        attempted_radius: f64,
    },
    MissingNode,
}

/// Result of coupling one slave list to one target node set
#[derive(Debug, Clone, Default)]
pub struct Coupling {
    pub constraints: Vec<Constraint>,
    /// Distance to the nearest master, parallel to `constraints`
    pub nearest_distances: Vec<f64>,
    pub coincident: usize,
    pub warnings: Vec<Warning>,
}

/// Couples every slave to its nearest masters in the target index
///
/// # Arguments
/// * `slaves` - Slave node ids, in output order
/// * `coupling` - Coupling kind stamped on every constraint
/// * `nodes` - The node arena
/// * `target` - Spatial index over the master node set
/// * `params` - Search settings
///
/// # Returns
/// Constraints in slave order, plus the unreachable warnings
pub fn couple(
    slaves: &[NodeId],
    coupling: CouplingKind,
    nodes: &NodeArena,
    target: &SpatialIndex,
    params: &SearchParams,
) -> Coupling {
    let bar = ProgressBar::new(slaves.len() as u64);

    let outcomes: Vec<(NodeId, SlaveOutcome)> = slaves
        .par_iter()
        .progress_with(bar.clone())
        .map(|&slave| {
            if target.contains(slave) {
                return (slave, SlaveOutcome::Coincident);
            }
            let Some(point) = nodes.position(slave) else {
                return (slave, SlaveOutcome::MissingNode);
            };

            let (found, attempted_radius) = search_growing(target, &point, params);
            match found.first() {
                None => (slave, SlaveOutcome::Unreachable { attempted_radius }),
                Some(first) => {
                    let nearest = first.distance;
                    let constraint = Constraint {
                        slave_node: slave,
                        dofs: TRANSLATIONAL_DOFS,
                        masters: inverse_distance_weights(&found, params.min_distance),
                        coupling,
                    };
                    (slave, SlaveOutcome::Constrained { constraint, nearest })
                }
            }
        })
        .collect();
    bar.finish_and_clear();

    let mut result = Coupling::default();
    for (slave, outcome) in outcomes {
        match outcome {
            SlaveOutcome::Constrained { constraint, nearest } => {
                result.constraints.push(constraint);
                result.nearest_distances.push(nearest);
            }
            SlaveOutcome::Coincident => result.coincident += 1,
            SlaveOutcome::Unreachable { attempted_radius } => {
                warn!(
                    node = slave,
                    coupling = coupling.label(),
                    "no master within {attempted_radius}, node left unconstrained"
                );
                result.warnings.push(Warning::ConstraintUnreachable {
                    node: slave,
                    attempted_radius,
                });
            }
            SlaveOutcome::MissingNode => debug!(node = slave, "slave node has no position"),
        }
    }

    result
}

/// Builds head-to-wall and bonded-to-soil constraints for every anchor
///
/// # Arguments
/// * `segmentation` - Anchor components with their heads and bonded nodes
/// * `nodes` - The node arena
/// * `wall_index` - Spatial index over the wall nodes
/// * `soil_index` - Spatial index over the soil nodes
/// * `params` - Search settings
///
/// # Returns
/// The constraint set with its report and warnings
pub fn synthesize(
    segmentation: &Segmentation,
    nodes: &NodeArena,
    wall_index: &SpatialIndex,
    soil_index: &SpatialIndex,
    params: &SearchParams,
) -> ConstraintSet {
    let heads: Vec<NodeId> = segmentation
        .head_nodes()
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let bonded = segmentation.bonded_nodes();

    info!(
        "coupling {} head(s) to {} wall node(s) and {} bonded node(s) to {} soil node(s)",
        heads.len(),
        wall_index.len(),
        bonded.len(),
        soil_index.len()
    );

    let head_coupling = couple(&heads, CouplingKind::HeadToWall, nodes, wall_index, params);
    let soil_coupling = couple(&bonded, CouplingKind::BondedToSoil, nodes, soil_index, params);

    let heads_beyond_tolerance = head_coupling
        .nearest_distances
        .iter()
        .filter(|d| **d > params.projection_tolerance)
        .count();
    if heads_beyond_tolerance > 0 {
        warn!(
            "{heads_beyond_tolerance} anchor head(s) are farther than {} from the wall",
            params.projection_tolerance
        );
    }

    let report = SynthesisReport {
        heads: heads.len(),
        bonded: bonded.len(),
        head_to_wall: head_coupling.constraints.len(),
        bonded_to_soil: soil_coupling.constraints.len(),
        coincident: head_coupling.coincident + soil_coupling.coincident,
        unreachable: head_coupling.warnings.len() + soil_coupling.warnings.len(),
        heads_beyond_tolerance,
    };
    info!(
        "created {} head-to-wall and {} bonded-to-soil constraint(s), \
         {} coincident, {} unreachable",
        report.head_to_wall, report.bonded_to_soil, report.coincident, report.unreachable
    );

    let mut warnings = head_coupling.warnings;
    warnings.extend(soil_coupling.warnings);

    ConstraintSet {
        wall_anchor: head_coupling.constraints,
        anchor_soil: soil_coupling.constraints,
        report,
        warnings,
    }
}
