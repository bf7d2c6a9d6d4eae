//! Adapter running an external finite-element solver once per stage.
//!
//! Each stage gets its own directory holding `stage_input.json`. The solver
//! command is run with that directory as its last argument and must leave a
//! `stage_result.json` behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use json::JsonValue;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    constitutive::SolverMaterial,
    constraints::Constraint,
    driver::{FieldState, StageInput, StageSolution, StageSolver},
    error::{Result, StagingError},
};

pub const STAGE_INPUT_FILE: &str = "stage_input.json";
pub const STAGE_RESULT_FILE: &str = "stage_result.json";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Executable to run. Nothing is solved when unset.
    pub command: Option<String>,
    /// Arguments placed before the stage directory
    pub args: Vec<String>,
    /// Directory holding the per-stage exchange directories
    pub work_dir: PathBuf,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            command: None,
            args: Vec::new(),
            work_dir: PathBuf::from("stages"),
        }
    }
}

pub struct ExternalSolver {
    command: String,
    args: Vec<String>,
    work_dir: PathBuf,
}

fn id_array<T: Copy + Into<JsonValue>, I: IntoIterator<Item = T>>(ids: I) -> JsonValue {
    JsonValue::Array(ids.into_iter().map(Into::into).collect())
}

fn constraint_json(constraint: &Constraint) -> JsonValue {
    let mut value = JsonValue::new_object();
    value["slave"] = constraint.slave_node.into();
    value["coupling"] = constraint.coupling.label().into();
    value["dofs"] = JsonValue::Array(constraint.dofs.iter().map(|d| d.label().into()).collect());
    value["masters"] = JsonValue::Array(
        constraint
            .masters
            .iter()
            .map(|m| {
                let mut master = JsonValue::new_object();
                master["node"] = m.node.into();
                master["weight"] = m.weight.into();
                master
            })
            .collect(),
    );
    value
}

fn material_json(material: &SolverMaterial) -> JsonValue {
    let mut value = JsonValue::new_object();
    value["id"] = material.material_id.into();
    value["young_modulus"] = material.elastic.elastic_modulus.into();
    value["poisson_ratio"] = material.elastic.poisson_ratio.into();
    value["density"] = material.elastic.density.into();
    value["hardening_modulus"] = material.hardening_modulus.into();
    value["mohr_coulomb"] = match &material.plasticity {
        Some(mc) => {
            let mut params = JsonValue::new_object();
            params["friction_deg"] = mc.friction_deg.into();
            params["cohesion_pa"] = mc.cohesion_pa.into();
            params["dilatancy_deg"] = mc.dilatancy_deg.into();
            params["yield_tension_pa"] = mc.yield_tension_pa.into();
            params["yield_compression_pa"] = mc.yield_compression_pa.into();
            params
        }
        None => JsonValue::Null,
    };
    value
}

fn previous_state_json(state: &FieldState) -> JsonValue {
    let mut value = JsonValue::new_object();
    value["stage"] = state.source_stage.into();
    value["restart_file"] = match &state.restart_file {
        Some(path) => path.display().to_string().into(),
        None => JsonValue::Null,
    };
    value["displacements"] = JsonValue::Array(
        state
            .displacements
            .iter()
            .map(|(node, u)| {
                let mut entry = JsonValue::new_object();
                entry["node"] = (*node).into();
                entry["ux"] = u.x.into();
                entry["uy"] = u.y.into();
                entry["uz"] = u.z.into();
                entry
            })
            .collect(),
    );
    value["element_stress"] = JsonValue::Array(
        state
            .element_stress
            .iter()
            .map(|(element, stress)| {
                let mut entry = JsonValue::new_object();
                entry["element"] = (*element).into();
                entry["stress"] = (*stress).into();
                entry
            })
            .collect(),
    );
    value
}

/// Serialises the active subset of a stage for the solver
pub fn stage_input_json(input: &StageInput) -> JsonValue {
    let context = &input.context;
    let mut value = JsonValue::new_object();
    value["stage_id"] = context.stage_id.into();
    value["name"] = context.name.as_str().into();
    value["active_materials"] = id_array(context.active_material_ids.iter().copied());
    value["active_loads"] = id_array(context.active_load_ids.iter().copied());
    value["active_boundaries"] = id_array(context.active_boundary_ids.iter().copied());
    value["inactive_elements"] = id_array(context.inactive_element_ids.iter().copied());
    value["active_elements"] = id_array(input.active_elements.iter().copied());
    value["constraints"] =
        JsonValue::Array(input.constraints.iter().map(constraint_json).collect());
    value["materials"] = JsonValue::Array(input.materials.iter().map(material_json).collect());
    value["previous_stage"] = match &context.previous_stage_state {
        Some(state) => previous_state_json(state),
        None => JsonValue::Null,
    };
    value
}

/// Reads a stage result written by the solver
///
/// # Arguments
/// * `result_json` - The result file as a JsonValue object
/// * `stage_id` - The stage being solved
/// * `stage_dir` - Directory relative restart paths are resolved against
///
/// # Returns
/// The stage solution with its field state
pub fn parse_stage_result(
    result_json: &JsonValue,
    stage_id: u32,
    stage_dir: &Path,
) -> Result<StageSolution> {
    let solver_error = |message: String| StagingError::Solver { stage_id, message };

    for key in ["max_displacement", "max_stress", "converged"] {
        if !result_json.has_key(key) {
            return Err(solver_error(format!("{STAGE_RESULT_FILE} is missing {key} field")));
        }
    }
    let max_displacement = result_json["max_displacement"]
        .as_f64()
        .ok_or_else(|| solver_error("Bad value for max_displacement".to_owned()))?;
    let max_stress = result_json["max_stress"]
        .as_f64()
        .ok_or_else(|| solver_error("Bad value for max_stress".to_owned()))?;
    let converged = result_json["converged"]
        .as_bool()
        .ok_or_else(|| solver_error("Bad value for converged".to_owned()))?;

    let mut displacements = BTreeMap::new();
    for entry in result_json["displacements"].members() {
        let node = entry["node"].as_u64();
        let (ux, uy, uz) = (entry["ux"].as_f64(), entry["uy"].as_f64(), entry["uz"].as_f64());
        match (node, ux, uy, uz) {
            (Some(node), Some(ux), Some(uy), Some(uz)) => {
                displacements.insert(node, Vector3::new(ux, uy, uz));
            }
            _ => return Err(solver_error(format!("Bad displacement entry {entry}"))),
        }
    }

    let mut element_stress = BTreeMap::new();
    for entry in result_json["element_stress"].members() {
        match (entry["element"].as_u64(), entry["stress"].as_f64()) {
            (Some(element), Some(stress)) => {
                element_stress.insert(element, stress);
            }
            _ => return Err(solver_error(format!("Bad stress entry {entry}"))),
        }
    }

    let restart_file = result_json["restart_file"].as_str().map(|p| {
        let path = PathBuf::from(p);
        if path.is_absolute() {
            path
        } else {
            stage_dir.join(path)
        }
    });

    Ok(StageSolution {
        max_displacement,
        max_stress,
        converged,
        state: FieldState {
            source_stage: stage_id,
            displacements,
            element_stress,
            restart_file,
        },
    })
}

impl ExternalSolver {
    /// Creates the adapter from the solver configuration
    ///
    /// # Returns
    /// The adapter, or a config error if no command is configured
    pub fn from_config(config: &SolverConfig) -> Result<ExternalSolver> {
        let command = config
            .command
            .clone()
            .ok_or_else(|| StagingError::Config("solver.command is not set".to_owned()))?;

        Ok(ExternalSolver {
            command,
            args: config.args.clone(),
            work_dir: config.work_dir.clone(),
        })
    }

    pub fn stage_dir(&self, stage_id: u32) -> PathBuf {
        self.work_dir.join(format!("stage_{stage_id}"))
    }
}

impl StageSolver for ExternalSolver {
    fn solve(&mut self, input: &StageInput) -> Result<StageSolution> {
        let stage_id = input.context.stage_id;
        let stage_dir = self.stage_dir(stage_id);
        std::fs::create_dir_all(&stage_dir)?;

        let input_path = stage_dir.join(STAGE_INPUT_FILE);
        std::fs::write(&input_path, stage_input_json(input).pretty(2))?;
        debug!(stage = stage_id, "wrote {}", input_path.display());

        // Stale results must not be mistaken for this run's
        let result_path = stage_dir.join(STAGE_RESULT_FILE);
        if result_path.exists() {
            std::fs::remove_file(&result_path)?;
        }

        info!(stage = stage_id, "running solver {}...", self.command);
        let output = match std::process::Command::new(&self.command)
            .args(&self.args)
            .arg(&stage_dir)
            .output()
        {
            Ok(out) => out,
            Err(err) => {
                return Err(StagingError::Solver {
                    stage_id,
                    message: format!("Failed to start {}: {err}", self.command),
                });
            }
        };

        if !output.status.success() {
            return Err(StagingError::Solver {
                stage_id,
                message: format!(
                    "{} exited with {}: {}",
                    self.command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let result_string = match std::fs::read_to_string(&result_path) {
            Ok(s) => s,
            Err(err) => {
                return Err(StagingError::Solver {
                    stage_id,
                    message: format!("Unable to read {}: {err}", result_path.display()),
                });
            }
        };
        let result_json = match json::parse(&result_string) {
            Ok(value) => value,
            Err(err) => {
                return Err(StagingError::Solver {
                    stage_id,
                    message: format!("Error in {STAGE_RESULT_FILE}: {err}"),
                });
            }
        };

        parse_stage_result(&result_json, stage_id, &stage_dir)
    }
}
