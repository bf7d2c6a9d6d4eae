//! Preparation and staged run of a model, end to end.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::{
    anchors::{assign_prestress, prestress_groups, segment, AnchorGrouping, Segmentation},
    classifier::{classify, Classification},
    config::PipelineConfig,
    constitutive::{convert_materials, MaterialConversion},
    constraints::{synthesize, ConstraintSet},
    datatypes::{MaterialId, Model},
    driver::{AnalysisReport, CancellationToken, Driver, StageSolver},
    error::{Result, RunFailure, StagingError, WarningSummary},
    spatial::SpatialIndex,
    stages::Schedule,
};

/// A model with everything the stage driver needs
pub struct Prepared {
    pub model: Model,
    pub classification: Classification,
    pub segmentation: Segmentation,
    pub constraints: ConstraintSet,
    pub materials: MaterialConversion,
    pub warnings: WarningSummary,
}

impl Prepared {
    /// Material ids used by elements but rejected during conversion
    pub fn rejected_in_use(&self) -> Vec<MaterialId> {
        self.model
            .material_ids()
            .into_iter()
            .filter(|id| self.materials.is_rejected(*id))
            .collect()
    }

    /// Fails if the driver would run with a rejected material
    pub fn ensure_materials(&self) -> Result<()> {
        let ids = self.rejected_in_use();
        if ids.is_empty() {
            Ok(())
        } else {
            Err(StagingError::MaterialsRejected { ids })
        }
    }

    pub fn support_materials(&self) -> &BTreeSet<MaterialId> {
        self.classification.support_materials()
    }
}

/// Classifies, segments, couples and converts a model
///
/// # Arguments
/// * `model` - The validated model
/// * `config` - Pipeline settings, validated before use
///
/// # Returns
/// The prepared model with the warnings collected on the way
pub fn prepare(model: Model, config: &PipelineConfig) -> Result<Prepared> {
    config.validate()?;
    model.validate()?;
    let mut warnings = WarningSummary::new();

    let classification = classify(&model.elements);
    warnings.extend(classification.warnings.iter().cloned());

    let wall_index = SpatialIndex::build(&model.nodes, &classification.wall_nodes);
    let soil_index = SpatialIndex::build(&model.nodes, &classification.soil_nodes);

    let grouping = AnchorGrouping::from_mesh_sets(
        &model.mesh_sets,
        &model.elements,
        &config.anchors.keywords(),
    );
    let mut segmentation = segment(
        &model.elements,
        &classification,
        &model.nodes,
        &wall_index,
        grouping.as_ref(),
        &config.anchors.segmenter(),
    );
    warnings.extend(segmentation.warnings.iter().cloned());

    assign_prestress(&mut segmentation.components, &model.anchor_prestress);
    for (force, components) in prestress_groups(&segmentation.components) {
        info!("prestress group {force} N: {} anchor(s)", components.len());
    }

    let constraints = synthesize(
        &segmentation,
        &model.nodes,
        &wall_index,
        &soil_index,
        &config.coupling,
    );
    warnings.extend(constraints.warnings.iter().cloned());

    let materials = convert_materials(&model.materials, &config.constitutive);

    let unconverted: Vec<MaterialId> = model
        .material_ids()
        .into_iter()
        .filter(|id| materials.get(*id).is_none() && !materials.is_rejected(*id))
        .collect();
    if !unconverted.is_empty() {
        warn!("elements use materials missing from the material table: {unconverted:?}");
    }

    info!(
        "prepared model: {} anchor(s), {} constraint(s), {} warning(s)",
        segmentation.anchor_count(),
        constraints.len(),
        warnings.total()
    );

    Ok(Prepared {
        model,
        classification,
        segmentation,
        constraints,
        materials,
        warnings,
    })
}

/// Runs the stage schedule over a prepared model
///
/// # Arguments
/// * `prepared` - The prepared model
/// * `schedule` - The stage schedule
/// * `solver` - The solver
/// * `config` - Pipeline settings
/// * `cancel` - Token checked between stages
///
/// # Returns
/// The analysis report carrying preparation and schedule warnings, or the
/// failure with the stages completed before it
pub fn run<S: StageSolver>(
    prepared: &Prepared,
    schedule: &Schedule,
    solver: &mut S,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> std::result::Result<AnalysisReport, RunFailure> {
    if let Err(error) = prepared.ensure_materials() {
        return Err(RunFailure {
            completed: Vec::new(),
            warnings: prepared.warnings.clone(),
            error,
        });
    }

    let driver = Driver::new(
        &prepared.model,
        &prepared.materials.converted,
        &prepared.constraints,
        prepared.support_materials(),
        config.driver.clone(),
    )
    .with_cancellation(cancel);

    let prefix_warnings = |run_warnings: WarningSummary| {
        let mut warnings = prepared.warnings.clone();
        warnings.merge(run_warnings);
        warnings
    };

    match driver.run(schedule, solver) {
        Ok(mut report) => {
            report.warnings = prefix_warnings(report.warnings);
            Ok(report)
        }
        Err(mut failure) => {
            failure.warnings = prefix_warnings(failure.warnings);
            Err(failure)
        }
    }
}
