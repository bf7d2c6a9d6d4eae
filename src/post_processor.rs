use std::path::{Path, PathBuf};

use tracing::info;

use crate::{
    constraints::ConstraintSet,
    driver::StageRecord,
    error::{Result, WarningSummary},
};

pub const STAGE_RESULTS_FILE: &str = "stage_results.csv";
pub const CONSTRAINTS_FILE: &str = "constraints.csv";
pub const WARNINGS_FILE: &str = "warnings.csv";

/// Writes one row per solved stage
///
/// # Arguments
/// * `records` - The stage records in run order
/// * `output` - The output csv path
pub fn write_stage_results(records: &[StageRecord], output: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(output)?;
    writer.write_record([
        "stage_id",
        "name",
        "status",
        "max_displacement",
        "max_stress",
        "converged",
        "active_elements",
        "active_materials",
        "active_constraints",
    ])?;

    for record in records {
        writer.write_record([
            record.stage_id.to_string(),
            record.name.clone(),
            record.status.name().to_owned(),
            record.max_displacement.to_string(),
            record.max_stress.to_string(),
            record.converged.to_string(),
            record.active_elements.to_string(),
            record.active_materials.to_string(),
            record.active_constraints.to_string(),
        ])?;
    }
    writer.flush()?;

    info!("wrote {} stage record(s) to {}", records.len(), output.display());
    Ok(())
}

/// Writes one row per master of every constraint
///
/// # Arguments
/// * `constraints` - The synthesized constraints
/// * `output` - The output csv path
pub fn write_constraints(constraints: &ConstraintSet, output: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(output)?;
    writer.write_record(["slave_node", "coupling", "master_node", "weight"])?;

    for constraint in constraints.iter() {
        for master in &constraint.masters {
            writer.write_record([
                constraint.slave_node.to_string(),
                constraint.coupling.label().to_owned(),
                master.node.to_string(),
                master.weight.to_string(),
            ])?;
        }
    }
    writer.flush()?;

    info!("wrote {} constraint(s) to {}", constraints.len(), output.display());
    Ok(())
}

/// Writes every collected warning with its kind
pub fn write_warnings(summary: &WarningSummary, output: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(output)?;
    writer.write_record(["kind", "id", "message"])?;

    for warning in &summary.warnings {
        writer.write_record([
            warning.kind().to_string(),
            warning.sample_id().to_string(),
            warning.to_string(),
        ])?;
    }
    writer.flush()?;

    info!("wrote {} warning(s) to {}", summary.total(), output.display());
    Ok(())
}

/// Writes the full result set into a directory
///
/// # Returns
/// The paths written
pub fn write_all(
    output_dir: &Path,
    records: &[StageRecord],
    constraints: &ConstraintSet,
    warnings: &WarningSummary,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(output_dir)?;

    let stage_path = output_dir.join(STAGE_RESULTS_FILE);
    let constraint_path = output_dir.join(CONSTRAINTS_FILE);
    let warning_path = output_dir.join(WARNINGS_FILE);

    write_stage_results(records, &stage_path)?;
    write_constraints(constraints, &constraint_path)?;
    write_warnings(warnings, &warning_path)?;

    Ok(vec![stage_path, constraint_path, warning_path])
}
