//! Mohr–Coulomb parameter conversion for the soil materials.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    datatypes::{MaterialCategory, MaterialId, MaterialRecord},
    error::{Result, StagingError},
};

const PLAUSIBLE_FRICTION_DEG: f64 = 45.0;
const PLAUSIBLE_COHESION_PA: f64 = 100_000.0;
const HARDENING_RATIO: f64 = 0.01;

/// Floors and offsets applied during conversion
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConstitutiveConfig {
    /// Lower clamp on the friction angle in degrees, 15 by default to keep
    /// the plastic solver away from near-zero friction. Zero disables it.
    pub friction_floor_deg: f64,
    pub tension_floor_pa: f64,
    pub compression_floor_pa: f64,
    /// Granular dilatancy is friction minus this offset, in degrees
    pub dilatancy_offset_deg: f64,
}

impl Default for ConstitutiveConfig {
    fn default() -> Self {
        ConstitutiveConfig {
            friction_floor_deg: 15.0,
            tension_floor_pa: 1_000.0,
            compression_floor_pa: 10_000.0,
            dilatancy_offset_deg: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MohrCoulombParams {
    /// Effective friction angle after the floor, in degrees
    pub friction_deg: f64,
    pub cohesion_pa: f64,
    pub dilatancy_deg: f64,
    pub yield_tension_pa: f64,
    pub yield_compression_pa: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElasticParams {
    pub elastic_modulus: f64,
    pub poisson_ratio: f64,
    pub density: f64,
}

/// A material as handed to the solver
#[derive(Debug, Clone, PartialEq)]
pub struct SolverMaterial {
    pub material_id: MaterialId,
    pub elastic: ElasticParams,
    pub hardening_modulus: f64,
    /// None for structural materials, which stay linear elastic
    pub plasticity: Option<MohrCoulombParams>,
}

#[derive(Debug, Default)]
pub struct MaterialConversion {
    pub converted: BTreeMap<MaterialId, SolverMaterial>,
    pub rejected: BTreeMap<MaterialId, StagingError>,
}

impl MaterialConversion {
    pub fn get(&self, id: MaterialId) -> Option<&SolverMaterial> {
        self.converted.get(&id)
    }

    pub fn is_rejected(&self, id: MaterialId) -> bool {
        self.rejected.contains_key(&id)
    }
}

fn out_of_range(
    material_id: MaterialId,
    parameter: &'static str,
    value: f64,
    reason: &str,
) -> StagingError {
    StagingError::ParameterOutOfRange {
        material_id,
        parameter,
        value,
        reason: reason.to_owned(),
    }
}

/// Derives Mohr–Coulomb yield parameters from friction and cohesion
///
/// # Arguments
/// * `material_id` - Material id, used in error reports
/// * `friction_deg` - Friction angle in degrees, within [0, 90)
/// * `cohesion_pa` - Cohesion in pascals, non-negative
/// * `category` - Cohesive soils get no dilatancy
/// * `config` - Floors and dilatancy offset
///
/// # Returns
/// The yield parameters, or ParameterOutOfRange for invalid input
pub fn mohr_coulomb(
    material_id: MaterialId,
    friction_deg: f64,
    cohesion_pa: f64,
    category: MaterialCategory,
    config: &ConstitutiveConfig,
) -> Result<MohrCoulombParams> {
    if !friction_deg.is_finite() || !(0.0..90.0).contains(&friction_deg) {
        return Err(out_of_range(
            material_id,
            "friction_deg",
            friction_deg,
            "expected a finite angle in [0, 90)",
        ));
    }
    if !cohesion_pa.is_finite() || cohesion_pa < 0.0 {
        return Err(out_of_range(
            material_id,
            "cohesion_pa",
            cohesion_pa,
            "expected a finite non-negative value",
        ));
    }

    if friction_deg > PLAUSIBLE_FRICTION_DEG {
        warn!(material = material_id, "unusually high friction angle {friction_deg}°");
    }
    if cohesion_pa > PLAUSIBLE_COHESION_PA {
        warn!(material = material_id, "unusually high cohesion {cohesion_pa} Pa");
    }

    let phi_eff = friction_deg.max(config.friction_floor_deg);
    if phi_eff != friction_deg {
        debug!(material = material_id, "friction angle {friction_deg}° raised to {phi_eff}°");
    }

    let phi = phi_eff.to_radians();
    let (sin_phi, cos_phi) = phi.sin_cos();
    let yield_tension =
        (2.0 * cohesion_pa * cos_phi / (1.0 + sin_phi)).max(config.tension_floor_pa);
    let yield_compression =
        (2.0 * cohesion_pa * cos_phi / (1.0 - sin_phi)).max(config.compression_floor_pa);

    let dilatancy = match category {
        MaterialCategory::Granular => (phi_eff - config.dilatancy_offset_deg).max(0.0),
        _ => 0.0,
    }
    .min(phi_eff);

    Ok(MohrCoulombParams {
        friction_deg: phi_eff,
        cohesion_pa,
        dilatancy_deg: dilatancy,
        yield_tension_pa: yield_tension,
        yield_compression_pa: yield_compression,
    })
}

fn elastic_params(record: &MaterialRecord) -> Result<ElasticParams> {
    let id = record.material_id;
    if !record.elastic_modulus.is_finite() || record.elastic_modulus <= 0.0 {
        return Err(out_of_range(id, "elastic_modulus", record.elastic_modulus, "must be positive"));
    }
    if !(0.0..0.5).contains(&record.poisson_ratio) {
        return Err(out_of_range(id, "poisson_ratio", record.poisson_ratio, "expected [0, 0.5)"));
    }
    if !record.density.is_finite() || record.density <= 0.0 {
        return Err(out_of_range(id, "density", record.density, "must be positive"));
    }
    Ok(ElasticParams {
        elastic_modulus: record.elastic_modulus,
        poisson_ratio: record.poisson_ratio,
        density: record.density,
    })
}

/// Converts one material record
pub fn convert_material(
    record: &MaterialRecord,
    config: &ConstitutiveConfig,
) -> Result<SolverMaterial> {
    let elastic = elastic_params(record)?;
    let plasticity = match record.category {
        MaterialCategory::Structural => None,
        category => Some(mohr_coulomb(
            record.material_id,
            record.friction_deg,
            record.cohesion_pa,
            category,
            config,
        )?),
    };

    Ok(SolverMaterial {
        material_id: record.material_id,
        hardening_modulus: HARDENING_RATIO * elastic.elastic_modulus,
        elastic,
        plasticity,
    })
}

/// Converts the material table. Each record succeeds or fails on its own.
///
/// # Arguments
/// * `records` - The raw material table
/// * `config` - Conversion floors
///
/// # Returns
/// Converted materials and per-material rejections
pub fn convert_materials(
    records: &[MaterialRecord],
    config: &ConstitutiveConfig,
) -> MaterialConversion {
    let mut conversion = MaterialConversion::default();

    for record in records {
        match convert_material(record, config) {
            Ok(material) => {
                conversion.converted.insert(record.material_id, material);
            }
            Err(e) => {
                warn!(material = record.material_id, "material rejected: {e}");
                conversion.rejected.insert(record.material_id, e);
            }
        }
    }

    info!(
        "converted {} material(s), rejected {}",
        conversion.converted.len(),
        conversion.rejected.len()
    );

    conversion
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn record(
        id: MaterialId,
        friction: f64,
        cohesion: f64,
        category: MaterialCategory,
    ) -> MaterialRecord {
        MaterialRecord {
            material_id: id,
            friction_deg: friction,
            cohesion_pa: cohesion,
            category,
            elastic_modulus: 20e6,
            poisson_ratio: 0.3,
            density: 1900.0,
        }
    }

    #[test]
    fn cohesive_soil_follows_the_yield_formulas() {
        let config = ConstitutiveConfig::default();
        let params = mohr_coulomb(1, 26.0, 9_000.0, MaterialCategory::Cohesive, &config).unwrap();

        assert_relative_eq!(params.yield_tension_pa, 11_247.65, max_relative = 1e-5);
        assert_relative_eq!(params.yield_compression_pa, 28_806.02, max_relative = 1e-5);
        assert_eq!(params.dilatancy_deg, 0.0);
        assert_eq!(params.friction_deg, 26.0);
    }

    #[test]
    fn granular_dilatancy_uses_the_offset() {
        let config = ConstitutiveConfig::default();
        let dense = mohr_coulomb(1, 38.0, 0.0, MaterialCategory::Granular, &config).unwrap();
        assert_relative_eq!(dense.dilatancy_deg, 8.0);

        let loose = mohr_coulomb(2, 28.0, 0.0, MaterialCategory::Granular, &config).unwrap();
        assert_eq!(loose.dilatancy_deg, 0.0);
    }

    #[test]
    fn floors_apply_to_cohesionless_material() {
        let config = ConstitutiveConfig::default();
        let params = mohr_coulomb(1, 30.0, 0.0, MaterialCategory::Granular, &config).unwrap();
        assert_eq!(params.yield_tension_pa, 1_000.0);
        assert_eq!(params.yield_compression_pa, 10_000.0);
    }

    #[test]
    fn friction_floor_clamps_and_can_be_disabled() {
        let defaults = ConstitutiveConfig::default();
        let clamped = mohr_coulomb(1, 5.0, 9_000.0, MaterialCategory::Cohesive, &defaults).unwrap();
        assert_eq!(clamped.friction_deg, 15.0);
        let phi = 15.0f64.to_radians();
        assert_relative_eq!(
            clamped.yield_tension_pa,
            2.0 * 9_000.0 * phi.cos() / (1.0 + phi.sin()),
            max_relative = 1e-12
        );

        let above = mohr_coulomb(1, 20.0, 9_000.0, MaterialCategory::Cohesive, &defaults).unwrap();
        assert_eq!(above.friction_deg, 20.0);

        let config = ConstitutiveConfig {
            friction_floor_deg: 0.0,
            ..ConstitutiveConfig::default()
        };
        let raw = mohr_coulomb(1, 0.0, 5_000.0, MaterialCategory::Cohesive, &config).unwrap();
        assert_eq!(raw.friction_deg, 0.0);
        assert_relative_eq!(raw.yield_tension_pa, 10_000.0);
    }

    #[test]
    fn out_of_range_parameters_are_rejected() {
        let config = ConstitutiveConfig::default();
        for friction in [-1.0, 90.0, f64::NAN, f64::INFINITY] {
            let err =
                mohr_coulomb(4, friction, 1.0, MaterialCategory::Cohesive, &config).unwrap_err();
            assert!(matches!(
                err,
                StagingError::ParameterOutOfRange {
                    material_id: 4,
                    parameter: "friction_deg",
                    ..
                }
            ));
        }
        assert!(mohr_coulomb(4, 20.0, -1.0, MaterialCategory::Cohesive, &config).is_err());
    }

    #[test]
    fn structural_materials_stay_elastic() {
        let mut steel = record(9, 0.0, 0.0, MaterialCategory::Structural);
        steel.elastic_modulus = 206e9;
        let material = convert_material(&steel, &ConstitutiveConfig::default()).unwrap();

        assert!(material.plasticity.is_none());
        assert_relative_eq!(material.hardening_modulus, 2.06e9);
    }

    #[test]
    fn one_bad_record_does_not_block_the_rest() {
        let mut bad_poisson = record(2, 25.0, 10_000.0, MaterialCategory::Cohesive);
        bad_poisson.poisson_ratio = 0.5;
        let records = vec![
            record(1, 30.0, 0.0, MaterialCategory::Granular),
            bad_poisson,
            record(3, 95.0, 0.0, MaterialCategory::Granular),
            record(4, 18.0, 25_000.0, MaterialCategory::Cohesive),
        ];

        let conversion = convert_materials(&records, &ConstitutiveConfig::default());

        assert_eq!(conversion.converted.keys().copied().collect::<Vec<_>>(), vec![1, 4]);
        assert!(conversion.is_rejected(2));
        assert!(conversion.is_rejected(3));
        assert!(conversion.get(4).unwrap().plasticity.is_some());
    }
}
