//! Stage schedule: activation sets per stage and their resolution.
//!
//! A stage either lists its active sets explicitly or describes a change
//! relative to the previous stage (excavate, backfill, add or remove
//! load and boundary groups, deactivate elements).

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::{
    datatypes::{ElementId, GroupId, MaterialId, Model},
    error::{IdKind, Result, StagingError, Warning},
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageDelta {
    pub excavate: BTreeSet<MaterialId>,
    pub backfill: BTreeSet<MaterialId>,
    pub add_loads: BTreeSet<GroupId>,
    pub remove_loads: BTreeSet<GroupId>,
    pub add_boundaries: BTreeSet<GroupId>,
    pub remove_boundaries: BTreeSet<GroupId>,
    pub excavate_elements: BTreeSet<ElementId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageActivation {
    Explicit {
        materials: BTreeSet<MaterialId>,
        loads: BTreeSet<GroupId>,
        boundaries: BTreeSet<GroupId>,
        inactive_elements: BTreeSet<ElementId>,
    },
    Delta(StageDelta),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageDefinition {
    pub id: u32,
    pub name: String,
    pub activation: StageActivation,
    /// The stage intentionally re-adds material, e.g. a backfill
    pub declares_readdition: bool,
}

impl StageDefinition {
    /// Every id the stage refers to, by kind
    fn referenced_ids(&self) -> Vec<(IdKind, u64)> {
        fn tagged(kind: IdKind, set: &BTreeSet<u32>) -> impl Iterator<Item = (IdKind, u64)> + '_ {
            set.iter().map(move |id| (kind, u64::from(*id)))
        }

        match &self.activation {
            StageActivation::Explicit {
                materials,
                loads,
                boundaries,
                inactive_elements,
            } => tagged(IdKind::Material, materials)
                .chain(tagged(IdKind::Load, loads))
                .chain(tagged(IdKind::Boundary, boundaries))
                .chain(inactive_elements.iter().map(|id| (IdKind::Element, *id)))
                .collect(),
            StageActivation::Delta(delta) => tagged(IdKind::Material, &delta.excavate)
                .chain(tagged(IdKind::Material, &delta.backfill))
                .chain(tagged(IdKind::Load, &delta.add_loads))
                .chain(tagged(IdKind::Load, &delta.remove_loads))
                .chain(tagged(IdKind::Boundary, &delta.add_boundaries))
                .chain(tagged(IdKind::Boundary, &delta.remove_boundaries))
                .chain(delta.excavate_elements.iter().map(|id| (IdKind::Element, *id)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    pub stages: Vec<StageDefinition>,
}

impl Schedule {
    pub fn new(stages: Vec<StageDefinition>) -> Schedule {
        Schedule { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Checks that stage ids are unique and strictly increasing
    ///
    /// # Returns
    /// StageDependencyBroken naming the first out-of-order stage
    pub fn validate_order(&self) -> Result<()> {
        for pair in self.stages.windows(2) {
            if pair[1].id <= pair[0].id {
                return Err(StagingError::StageDependencyBroken {
                    stage_id: pair[1].id,
                    kind: IdKind::Stage,
                    id: u64::from(pair[1].id),
                });
            }
        }
        Ok(())
    }
}

/// Ids known to the model, used to validate stage references
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    pub materials: BTreeSet<MaterialId>,
    pub loads: BTreeSet<GroupId>,
    pub boundaries: BTreeSet<GroupId>,
    pub elements: BTreeSet<ElementId>,
    /// Wall and anchor materials, never excavated
    pub support_materials: BTreeSet<MaterialId>,
}

impl Catalog {
    /// Builds the catalog from a model and its support material ids
    pub fn from_model(model: &Model, support_materials: &BTreeSet<MaterialId>) -> Catalog {
        let mut materials: BTreeSet<MaterialId> =
            model.materials.iter().map(|m| m.material_id).collect();
        materials.extend(model.material_ids());

        Catalog {
            materials,
            loads: model.load_groups.clone(),
            boundaries: model.boundary_groups.clone(),
            elements: model.element_ids(),
            support_materials: support_materials.clone(),
        }
    }

    /// Everything in the model active: the state a first Delta stage starts from
    pub fn initial_sets(&self) -> ActiveSets {
        ActiveSets {
            materials: self.materials.clone(),
            loads: self.loads.clone(),
            boundaries: self.boundaries.clone(),
            inactive_elements: BTreeSet::new(),
        }
    }

    fn knows(&self, kind: IdKind, id: u64) -> bool {
        let as_u32 = u32::try_from(id).ok();
        match kind {
            IdKind::Material => as_u32.is_some_and(|v| self.materials.contains(&v)),
            IdKind::Load => as_u32.is_some_and(|v| self.loads.contains(&v)),
            IdKind::Boundary => as_u32.is_some_and(|v| self.boundaries.contains(&v)),
            IdKind::Element => self.elements.contains(&id),
            IdKind::Stage => true,
        }
    }
}

/// Resolved activation state of one stage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveSets {
    pub materials: BTreeSet<MaterialId>,
    pub loads: BTreeSet<GroupId>,
    pub boundaries: BTreeSet<GroupId>,
    pub inactive_elements: BTreeSet<ElementId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub active: ActiveSets,
    pub warnings: Vec<Warning>,
}

fn schedule_warning(stage_id: u32, material_ids: Vec<MaterialId>, reason: &str) -> Warning {
    warn!(stage = stage_id, "{reason}: {material_ids:?}");
    Warning::ScheduleInconsistent {
        stage_id,
        material_ids,
        reason: reason.to_owned(),
    }
}

/// Resolves and validates the activation sets of one stage
///
/// # Arguments
/// * `stage` - The stage definition
/// * `previous` - Active sets of the preceding stage, if any
/// * `catalog` - Ids known to the model
///
/// # Returns
/// The active sets with any schedule warnings, or StageDependencyBroken
/// when the stage names an unknown id
pub fn resolve_stage(
    stage: &StageDefinition,
    previous: Option<&ActiveSets>,
    catalog: &Catalog,
) -> Result<Resolution> {
    if let Some((kind, id)) = stage
        .referenced_ids()
        .into_iter()
        .find(|(kind, id)| !catalog.knows(*kind, *id))
    {
        return Err(StagingError::StageDependencyBroken {
            stage_id: stage.id,
            kind,
            id,
        });
    }

    let initial;
    let before = match (previous, &stage.activation) {
        (Some(previous), _) => previous,
        (None, StageActivation::Delta(_)) => {
            debug!(stage = stage.id, "first stage is a delta, starting from the full model");
            initial = catalog.initial_sets();
            &initial
        }
        (None, StageActivation::Explicit { .. }) => {
            initial = ActiveSets::default();
            &initial
        }
    };
    let mut warnings = Vec::new();

    let (active, declared) = match &stage.activation {
        StageActivation::Explicit {
            materials,
            loads,
            boundaries,
            inactive_elements,
        } => {
            let mut materials = materials.clone();
            let dropped: Vec<MaterialId> = before
                .materials
                .intersection(&catalog.support_materials)
                .filter(|m| !materials.contains(*m))
                .copied()
                .collect();
            if !dropped.is_empty() {
                warnings.push(schedule_warning(
                    stage.id,
                    dropped.clone(),
                    "support materials cannot be removed, keeping them active",
                ));
                materials.extend(dropped);
            }

            let active = ActiveSets {
                materials,
                loads: loads.clone(),
                boundaries: boundaries.clone(),
                inactive_elements: inactive_elements.clone(),
            };
            (active, BTreeSet::new())
        }
        StageActivation::Delta(delta) => {
            let protected: Vec<MaterialId> = delta
                .excavate
                .intersection(&catalog.support_materials)
                .copied()
                .collect();
            if !protected.is_empty() {
                warnings.push(schedule_warning(
                    stage.id,
                    protected,
                    "excavation of support materials ignored",
                ));
            }

            let mut materials: BTreeSet<MaterialId> = before
                .materials
                .iter()
                .filter(|m| !delta.excavate.contains(*m) || catalog.support_materials.contains(*m))
                .copied()
                .collect();
            materials.extend(delta.backfill.iter().copied());

            let mut loads: BTreeSet<GroupId> =
                before.loads.difference(&delta.remove_loads).copied().collect();
            loads.extend(delta.add_loads.iter().copied());

            let mut boundaries: BTreeSet<GroupId> =
                before.boundaries.difference(&delta.remove_boundaries).copied().collect();
            boundaries.extend(delta.add_boundaries.iter().copied());

            let mut inactive_elements = before.inactive_elements.clone();
            inactive_elements.extend(delta.excavate_elements.iter().copied());

            let active = ActiveSets {
                materials,
                loads,
                boundaries,
                inactive_elements,
            };
            (active, delta.backfill.clone())
        }
    };

    if let Some(before) = previous {
        let readded: Vec<MaterialId> = active
            .materials
            .difference(&before.materials)
            .filter(|m| !declared.contains(*m))
            .copied()
            .collect();
        if !readded.is_empty() && !stage.declares_readdition {
            warnings.push(schedule_warning(
                stage.id,
                readded,
                "material set grows without a declared re-addition",
            ));
        }
    }

    debug!(
        stage = stage.id,
        materials = active.materials.len(),
        loads = active.loads.len(),
        boundaries = active.boundaries.len(),
        inactive_elements = active.inactive_elements.len(),
        "resolved stage activation"
    );

    Ok(Resolution { active, warnings })
}
