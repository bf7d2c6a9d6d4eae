//! Shared fixtures: a small anchored excavation model and a recording solver.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use geostage::{
    datatypes::{Element, MaterialCategory, MaterialRecord, Model, Node, NodeArena, NodeId},
    driver::{CancellationToken, FieldState, StageInput, StageSolution, StageSolver},
    error::{Result, StagingError},
    stages::{Schedule, StageActivation, StageDefinition, StageDelta},
};
use nalgebra::{Point3, Vector3};

pub const CLAY: u32 = 1;
pub const SAND: u32 = 2;
pub const CONCRETE: u32 = 5;
pub const STEEL: u32 = 13;

pub const SOIL_ELEMENTS: usize = 88;
pub const WALL_ELEMENTS: usize = 32;
pub const ANCHOR_ELEMENTS: usize = 20;
pub const CLAY_ELEMENTS: usize = 40;

fn soil_node_id(ix: u64, iy: u64, iz: u64) -> NodeId {
    1000 + ix * 100 + iy * 10 + iz
}

fn wall_node_id(iy: u64, iz: u64) -> NodeId {
    100 + iy * 10 + iz
}

fn material(
    id: u32,
    friction: f64,
    cohesion: f64,
    category: MaterialCategory,
    e: f64,
) -> MaterialRecord {
    MaterialRecord {
        material_id: id,
        friction_deg: friction,
        cohesion_pa: cohesion,
        category,
        elastic_modulus: e,
        poisson_ratio: 0.3,
        density: 2000.0,
    }
}

/// Wall in the plane x = 0, two horizontal anchors at y = -2 and y = 2
/// running into a tetrahedral soil block. Clay fills x < 6, sand the rest.
pub fn excavation_model() -> Model {
    let mut nodes = NodeArena::new();
    let mut elements = Vec::new();

    // Soil: x = 1..12, y = -4..4 step 2, z = -2..2 step 2
    for ix in 0..12u64 {
        for iy in 0..5u64 {
            for iz in 0..3u64 {
                nodes
                    .insert(Node {
                        id: soil_node_id(ix, iy, iz),
                        position: Point3::new(
                            1.0 + ix as f64,
                            -4.0 + 2.0 * iy as f64,
                            -2.0 + 2.0 * iz as f64,
                        ),
                    })
                    .unwrap();
            }
        }
    }
    let mut element_id = 5000;
    for ix in 0..11u64 {
        for iy in 0..4u64 {
            for iz in 0..2u64 {
                elements.push(Element {
                    id: element_id,
                    type_tag: "Tetrahedra3D4N".to_owned(),
                    node_ids: vec![
                        soil_node_id(ix, iy, iz),
                        soil_node_id(ix + 1, iy, iz),
                        soil_node_id(ix, iy + 1, iz),
                        soil_node_id(ix, iy, iz + 1),
                    ],
                    material_id: if ix < 5 { CLAY } else { SAND },
                });
                element_id += 1;
            }
        }
    }

    // Wall: y = -4..4, z = -2..2, one metre panels
    for iy in 0..9u64 {
        for iz in 0..5u64 {
            nodes
                .insert(Node {
                    id: wall_node_id(iy, iz),
                    position: Point3::new(0.0, -4.0 + iy as f64, -2.0 + iz as f64),
                })
                .unwrap();
        }
    }
    let mut element_id = 300;
    for iy in 0..8u64 {
        for iz in 0..4u64 {
            elements.push(Element {
                id: element_id,
                type_tag: "ShellThinElementCorotational3D4N".to_owned(),
                node_ids: vec![
                    wall_node_id(iy, iz),
                    wall_node_id(iy + 1, iz),
                    wall_node_id(iy + 1, iz + 1),
                    wall_node_id(iy, iz + 1),
                ],
                material_id: CONCRETE,
            });
            element_id += 1;
        }
    }

    // Anchors: nodes 1..=11 at y = -2 and 21..=31 at y = 2, x = 0.5..10.5
    let mut element_id = 400;
    for (first, y) in [(1u64, -2.0), (21u64, 2.0)] {
        for i in 0..11u64 {
            nodes
                .insert(Node {
                    id: first + i,
                    position: Point3::new(0.5 + i as f64, y, 0.0),
                })
                .unwrap();
        }
        for i in 0..10u64 {
            elements.push(Element {
                id: element_id,
                type_tag: "TrussElement3D2N".to_owned(),
                node_ids: vec![first + i, first + i + 1],
                material_id: STEEL,
            });
            element_id += 1;
        }
    }

    Model {
        nodes,
        elements,
        materials: vec![
            material(CLAY, 26.0, 9_000.0, MaterialCategory::Cohesive, 20e6),
            material(SAND, 32.0, 0.0, MaterialCategory::Granular, 40e6),
            material(CONCRETE, 0.0, 0.0, MaterialCategory::Structural, 30e9),
            material(STEEL, 0.0, 0.0, MaterialCategory::Structural, 206e9),
        ],
        mesh_sets: Vec::new(),
        load_groups: BTreeSet::from([1, 2]),
        boundary_groups: BTreeSet::from([1]),
        anchor_prestress: BTreeMap::from([(400, 345_000.0), (410, 345_000.0)]),
    }
}

pub fn explicit_stage(id: u32, materials: &[u32]) -> StageDefinition {
    StageDefinition {
        id,
        name: format!("Stage {id}"),
        activation: StageActivation::Explicit {
            materials: materials.iter().copied().collect(),
            loads: BTreeSet::from([1]),
            boundaries: BTreeSet::from([1]),
            inactive_elements: BTreeSet::new(),
        },
        declares_readdition: false,
    }
}

pub fn delta_stage(id: u32, delta: StageDelta) -> StageDefinition {
    StageDefinition {
        id,
        name: format!("Stage {id}"),
        activation: StageActivation::Delta(delta),
        declares_readdition: false,
    }
}

/// Initial state, clay excavation, then an extra load group
pub fn three_stage_schedule() -> Schedule {
    Schedule::new(vec![
        explicit_stage(1, &[CLAY, SAND, CONCRETE, STEEL]),
        delta_stage(
            2,
            StageDelta {
                excavate: BTreeSet::from([CLAY]),
                ..StageDelta::default()
            },
        ),
        delta_stage(
            3,
            StageDelta {
                add_loads: BTreeSet::from([2]),
                ..StageDelta::default()
            },
        ),
    ])
}

/// What the solver saw for one stage
#[derive(Debug, Clone)]
pub struct SolverCall {
    pub stage_id: u32,
    pub previous_stage: Option<u32>,
    pub active_elements: usize,
    pub constraints: usize,
    pub materials: Vec<u32>,
    pub loads: Vec<u32>,
}

/// Solver double recording each call and answering with a fake field
#[derive(Default)]
pub struct RecordingSolver {
    pub calls: Vec<SolverCall>,
    /// Stages reported as not converged
    pub diverging: BTreeSet<u32>,
    /// Stages that fail outright
    pub failing: BTreeSet<u32>,
    /// Cancelled once the given stage has been solved
    pub cancel_after: Option<(u32, CancellationToken)>,
}

impl StageSolver for RecordingSolver {
    fn solve(&mut self, input: &StageInput) -> Result<StageSolution> {
        let context = &input.context;
        self.calls.push(SolverCall {
            stage_id: context.stage_id,
            previous_stage: context.previous_stage_state.as_ref().map(|s| s.source_stage),
            active_elements: input.active_elements.len(),
            constraints: input.constraints.len(),
            materials: input.materials.iter().map(|m| m.material_id).collect(),
            loads: context.active_load_ids.iter().copied().collect(),
        });

        if self.failing.contains(&context.stage_id) {
            return Err(StagingError::Solver {
                stage_id: context.stage_id,
                message: "matrix is singular".to_owned(),
            });
        }
        if let Some((stage, token)) = &self.cancel_after {
            if *stage == context.stage_id {
                token.cancel();
            }
        }

        let max_displacement = 0.005 * context.stage_id as f64;
        let displacements = input
            .active_nodes
            .iter()
            .map(|n| (*n, Vector3::new(0.0, 0.0, -max_displacement)))
            .collect();

        Ok(StageSolution {
            max_displacement,
            max_stress: 1.0e5 * context.stage_id as f64,
            converged: !self.diverging.contains(&context.stage_id),
            state: FieldState {
                source_stage: context.stage_id,
                displacements,
                element_stress: BTreeMap::new(),
                restart_file: None,
            },
        })
    }
}
