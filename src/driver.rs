//! Runs the stage schedule: one blocking solver call per stage, each stage
//! starting from the state the previous one produced.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    constitutive::SolverMaterial,
    constraints::{Constraint, ConstraintSet},
    datatypes::{ElementId, GroupId, MaterialId, Model, NodeId},
    error::{Result, RunFailure, StagingError, WarningSummary},
    stages::{resolve_stage, ActiveSets, Catalog, Schedule, StageDefinition},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn name(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }

    /// Moves to the next status if the transition is legal
    ///
    /// # Arguments
    /// * `to` - The requested status
    /// * `stage_id` - Stage id for the error report
    ///
    /// # Returns
    /// The new status, or InvalidTransition
    pub fn advance(self, to: StageStatus, stage_id: u32) -> Result<StageStatus> {
        match (self, to) {
            (StageStatus::Pending, StageStatus::Running)
            | (StageStatus::Running, StageStatus::Completed)
            | (StageStatus::Running, StageStatus::Failed) => Ok(to),
            _ => Err(StagingError::InvalidTransition {
                stage_id,
                from: self.name(),
                to: to.name(),
            }),
        }
    }
}

/// Solved field handed from one stage to the next
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldState {
    pub source_stage: u32,
    pub displacements: BTreeMap<NodeId, Vector3<f64>>,
    pub element_stress: BTreeMap<ElementId, f64>,
    /// Solver-side restart data, if the solver keeps its own
    pub restart_file: Option<PathBuf>,
}

/// Everything the solver needs to know about the stage being run
#[derive(Debug, Clone, PartialEq)]
pub struct StageContext {
    pub stage_id: u32,
    pub name: String,
    pub active_material_ids: BTreeSet<MaterialId>,
    pub active_load_ids: BTreeSet<GroupId>,
    pub active_boundary_ids: BTreeSet<GroupId>,
    pub inactive_element_ids: BTreeSet<ElementId>,
    /// None for the first stage only
    pub previous_stage_state: Option<FieldState>,
}

/// Active subset of the model for one solver call
#[derive(Debug, Clone)]
pub struct StageInput {
    pub context: StageContext,
    pub active_elements: Vec<ElementId>,
    pub active_nodes: BTreeSet<NodeId>,
    pub constraints: Vec<Constraint>,
    pub materials: Vec<SolverMaterial>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageSolution {
    pub max_displacement: f64,
    pub max_stress: f64,
    pub converged: bool,
    pub state: FieldState,
}

/// The finite-element solver as seen from the driver
pub trait StageSolver {
    /// Solves one stage. Blocks until the solver returns.
    fn solve(&mut self, input: &StageInput) -> Result<StageSolution>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageRecord {
    pub stage_id: u32,
    pub name: String,
    pub status: StageStatus,
    pub max_displacement: f64,
    pub max_stress: f64,
    pub converged: bool,
    pub active_elements: usize,
    pub active_materials: usize,
    pub active_constraints: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisReport {
    pub stages: Vec<StageRecord>,
    pub warnings: WarningSummary,
    /// Set when a cancellation request stopped the run before this stage
    pub cancelled_before: Option<u32>,
}

/// Shared flag asking the driver to stop at the next stage boundary
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Abort the run when a stage does not converge
    pub stop_on_divergence: bool,
}

pub struct Driver<'a> {
    model: &'a Model,
    materials: &'a BTreeMap<MaterialId, SolverMaterial>,
    constraints: &'a ConstraintSet,
    catalog: Catalog,
    config: DriverConfig,
    cancel: CancellationToken,
}

impl<'a> Driver<'a> {
    /// Creates a driver over a prepared model
    ///
    /// # Arguments
    /// * `model` - The model
    /// * `materials` - Converted materials by id
    /// * `constraints` - Synthesized constraints
    /// * `support_materials` - Wall and anchor material ids
    /// * `config` - Driver options
    pub fn new(
        model: &'a Model,
        materials: &'a BTreeMap<MaterialId, SolverMaterial>,
        constraints: &'a ConstraintSet,
        support_materials: &BTreeSet<MaterialId>,
        config: DriverConfig,
    ) -> Driver<'a> {
        Driver {
            model,
            materials,
            constraints,
            catalog: Catalog::from_model(model, support_materials),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Driver<'a> {
        self.cancel = token;
        self
    }

    /// Assembles the active subset of the model for a stage
    fn assemble(&self, context: StageContext) -> StageInput {
        let mut active_elements = Vec::new();
        let mut active_nodes = BTreeSet::new();
        for element in &self.model.elements {
            if context.active_material_ids.contains(&element.material_id)
                && !context.inactive_element_ids.contains(&element.id)
            {
                active_elements.push(element.id);
                active_nodes.extend(element.node_ids.iter().copied());
            }
        }

        let constraints: Vec<Constraint> = self
            .constraints
            .iter()
            .filter(|c| active_nodes.contains(&c.slave_node))
            .filter_map(|c| c.retain_masters(|n| active_nodes.contains(&n)))
            .collect();

        let materials: Vec<SolverMaterial> = context
            .active_material_ids
            .iter()
            .filter_map(|id| self.materials.get(id))
            .cloned()
            .collect();

        StageInput {
            context,
            active_elements,
            active_nodes,
            constraints,
            materials,
        }
    }

    fn run_stage<S: StageSolver>(
        &self,
        stage: &StageDefinition,
        active: &ActiveSets,
        previous_state: Option<FieldState>,
        solver: &mut S,
    ) -> Result<(StageRecord, FieldState)> {
        let mut status = StageStatus::Pending;

        let context = StageContext {
            stage_id: stage.id,
            name: stage.name.clone(),
            active_material_ids: active.materials.clone(),
            active_load_ids: active.loads.clone(),
            active_boundary_ids: active.boundaries.clone(),
            inactive_element_ids: active.inactive_elements.clone(),
            previous_stage_state: previous_state,
        };
        let input = self.assemble(context);

        info!(
            stage = stage.id,
            "running '{}' with {} element(s), {} material(s), {} constraint(s)",
            stage.name,
            input.active_elements.len(),
            input.materials.len(),
            input.constraints.len()
        );

        status = status.advance(StageStatus::Running, stage.id)?;
        let solution = match solver.solve(&input) {
            Ok(solution) => solution,
            Err(e) => {
                status.advance(StageStatus::Failed, stage.id)?;
                return Err(e);
            }
        };
        status = status.advance(StageStatus::Completed, stage.id)?;

        let record = StageRecord {
            stage_id: stage.id,
            name: stage.name.clone(),
            status,
            max_displacement: solution.max_displacement,
            max_stress: solution.max_stress,
            converged: solution.converged,
            active_elements: input.active_elements.len(),
            active_materials: input.materials.len(),
            active_constraints: input.constraints.len(),
        };

        Ok((record, solution.state))
    }

    /// Runs every stage of the schedule in order
    ///
    /// # Arguments
    /// * `schedule` - The stage schedule
    /// * `solver` - The solver, called once per stage
    ///
    /// # Returns
    /// The per-stage records and schedule warnings, or a RunFailure holding
    /// the stages completed before the fatal error
    pub fn run<S: StageSolver>(
        &self,
        schedule: &Schedule,
        solver: &mut S,
    ) -> std::result::Result<AnalysisReport, RunFailure> {
        let mut report = AnalysisReport::default();

        if let Err(error) = schedule.validate_order() {
            return Err(RunFailure {
                completed: Vec::new(),
                warnings: report.warnings,
                error,
            });
        }

        let mut previous_active: Option<ActiveSets> = None;
        let mut previous_state: Option<FieldState> = None;

        for stage in &schedule.stages {
            if self.cancel.is_cancelled() {
                info!(stage = stage.id, "cancelled before stage");
                report.cancelled_before = Some(stage.id);
                return Ok(report);
            }

            let outcome = resolve_stage(stage, previous_active.as_ref(), &self.catalog)
                .and_then(|resolution| {
                    report.warnings.extend(resolution.warnings);
                    let stage_result =
                        self.run_stage(stage, &resolution.active, previous_state.take(), solver)?;
                    Ok((resolution.active, stage_result))
                });

            let (active, (record, state)) = match outcome {
                Ok(done) => done,
                Err(error) => {
                    warn!(stage = stage.id, "run aborted: {error}");
                    return Err(RunFailure {
                        completed: report.stages,
                        warnings: report.warnings,
                        error,
                    });
                }
            };

            let converged = record.converged;
            info!(
                stage = stage.id,
                "max displacement {:.6e}, max stress {:.6e}, converged: {}",
                record.max_displacement,
                record.max_stress,
                converged
            );
            report.stages.push(record);

            if !converged {
                warn!(stage = stage.id, "stage did not converge");
                if self.config.stop_on_divergence {
                    return Err(RunFailure {
                        completed: report.stages,
                        warnings: report.warnings,
                        error: StagingError::Solver {
                            stage_id: stage.id,
                            message: "stage did not converge".to_owned(),
                        },
                    });
                }
            }

            previous_active = Some(active);
            previous_state = Some(state);
        }

        info!("completed {} stage(s)", report.stages.len());
        Ok(report)
    }
}
